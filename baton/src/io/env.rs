//! Process environment access for the spawn contract.

use std::ffi::OsString;

use tracing::warn;

use crate::core::context::SpawnEnv;

const CONTRACT_PREFIX: &str = "BATON_";

/// Read the spawn contract from this process's environment.
pub fn current_spawn_env() -> SpawnEnv {
    SpawnEnv::from_vars(contract_vars(std::env::vars_os()))
}

/// Read one variable, treating a non-UTF-8 value as unset.
pub fn utf8_var(name: &str) -> Option<String> {
    let value = std::env::var_os(name)?;
    match value.into_string() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, "ignoring non-utf-8 environment variable");
            None
        }
    }
}

/// `BATON_*` pairs from raw OS strings. Other names are dropped unread;
/// contract entries that are not valid UTF-8 are skipped.
fn contract_vars<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let key = key.into_string().ok()?;
            if !key.starts_with(CONTRACT_PREFIX) {
                return None;
            }
            match value.into_string() {
                Ok(value) => Some((key, value)),
                Err(_) => {
                    warn!(name = %key, "ignoring non-utf-8 environment variable");
                    None
                }
            }
        })
        .collect()
}

/// Render variables as POSIX `export` lines for `eval "$(baton spawn-env ...)"`.
pub fn render_exports(env: &SpawnEnv) -> String {
    env.to_vars()
        .into_iter()
        .map(|(key, value)| format!("export {key}={}\n", shell_quote(&value)))
        .collect()
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::spawn_env;

    #[test]
    fn exports_are_sorted_and_quoted() {
        let env = spawn_env("S1", Some("E 7"), "gemini");
        let rendered = render_exports(&env);
        assert_eq!(
            rendered,
            "export BATON_AGENT_LABEL=gemini\n\
             export BATON_PARENT_EVENT='E 7'\n\
             export BATON_PARENT_SESSION=S1\n\
             export BATON_SUBAGENT_TYPE=gemini\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_entries_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let bad = || OsString::from_vec(vec![0x66, 0xff, 0x6f]);
        let vars = vec![
            (OsString::from("PATH"), bad()),
            (bad(), OsString::from("x")),
            (OsString::from("BATON_SUBAGENT_TYPE"), OsString::from("gemini")),
            (OsString::from("BATON_PARENT_SESSION"), OsString::from("S1")),
            (OsString::from("BATON_PARENT_EVENT"), bad()),
        ];
        let env = SpawnEnv::from_vars(contract_vars(vars));
        assert_eq!(env.subagent_type.as_deref(), Some("gemini"));
        assert_eq!(env.parent_session.as_deref(), Some("S1"));
        assert_eq!(env.parent_event, None);
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
