//! Environment-variable gates. Both gates are resolved to a plain boolean at the moment
//! they are configured; the environment is never consulted again afterwards.

/// Open iff `variable` is set in the process environment, including to an empty string.
pub fn exists(variable: &str) -> bool {
    evaluate_with(read_env, variable, None::<fn(Option<&str>) -> bool>)
}

/// Open iff `predicate` accepts the value of `variable` (`None` when unset). A value that
/// is not valid unicode is passed lossily.
pub fn matches<P>(variable: &str, predicate: P) -> bool
where
    P: FnOnce(Option<&str>) -> bool,
{
    evaluate_with(read_env, variable, Some(predicate))
}

/// Evaluate a gate, reading the variable through `lookup`. Without a predicate the gate
/// is open iff the variable is set.
pub fn evaluate_with<L, P>(lookup: L, variable: &str, predicate: Option<P>) -> bool
where
    L: FnOnce(&str) -> Option<String>,
    P: FnOnce(Option<&str>) -> bool,
{
    let value = lookup(variable);
    match predicate {
        Some(check) => check(value.as_deref()),
        None => value.is_some(),
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var_os(name).map(|value| value.to_string_lossy().into_owned())
}
