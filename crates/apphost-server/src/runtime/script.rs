//! Compilation policy
//!
//! How a source file is wrapped depends on where it lives in the application:
//!
//! | Location | Wrapped as |
//! |----------|-----------|
//! | `/api/**` | `(connection => (<source>))`, a connection handler factory |
//! | `/lib/**/*.test.js`, `/test/**` | `(test => { <source> })`, a test function |
//! | anything else | the bare source; a source starting with `{` is parenthesized |
//!
//! Every wrapper starts with a strict-mode directive on the first source line,
//! so reported line numbers match the file on disk.

use std::cell::RefCell;
use std::time::Duration;

/// Wall-clock budget of one compile.
pub const SCRIPT_PREPARE_TIMEOUT: Duration = Duration::from_millis(500);

const USE_STRICT: &str = "'use strict'; ";

/// Wrapper selected for a script key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Api,
    Test,
    Code,
}

impl ScriptKind {
    /// Picks the wrapper for an application-relative key such as `/lib/a.js`.
    pub fn for_key(key: &str) -> Self {
        if key.starts_with("/api/") {
            ScriptKind::Api
        } else if (key.starts_with("/lib/") && key.ends_with(".test.js")) || key.starts_with("/test/")
        {
            ScriptKind::Test
        } else {
            ScriptKind::Code
        }
    }

    /// Produces the source that is actually evaluated.
    pub fn wrap(self, source: &str) -> String {
        match self {
            ScriptKind::Api => {
                format!("{}(connection => ({}\n))", USE_STRICT, strip_semicolon(source))
            }
            ScriptKind::Test => {
                format!("{}(test => {{{}\n}})", USE_STRICT, strip_semicolon(source))
            }
            ScriptKind::Code => {
                let trimmed = source.trim_start();
                if trimmed.starts_with('{') {
                    format!("{}({}\n)", USE_STRICT, strip_semicolon(source))
                } else {
                    format!("{}{}", USE_STRICT, source)
                }
            }
        }
    }
}

fn strip_semicolon(source: &str) -> &str {
    let s = source.trim();
    s.strip_suffix(';').unwrap_or(s)
}

thread_local! {
    static SCRIPT_SCOPE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as executing application script code until the
/// guard drops. The fatal-error handler consults it to tell recoverable
/// script failures from crashes.
pub struct ScriptScope(());

impl ScriptScope {
    pub fn enter(app_name: &str) -> Self {
        SCRIPT_SCOPE.with(|s| s.borrow_mut().push(app_name.to_string()));
        ScriptScope(())
    }
}

impl Drop for ScriptScope {
    fn drop(&mut self) {
        SCRIPT_SCOPE.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Application whose script is executing on this thread, if any.
pub fn current_script_app() -> Option<String> {
    SCRIPT_SCOPE.with(|s| s.borrow().last().cloned())
}
