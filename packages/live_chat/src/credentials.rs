//! Bearer credential accessors.
//!
//! A credential is read at send time, never cached by the session, so a
//! token refreshed mid-session is picked up by the next send.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Blank tokens count as absent.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Supplies the current credential, or `None` when signed out.
pub trait CredentialSource: Send + Sync {
    fn current(&self) -> Option<Credential>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current(&self) -> Option<Credential> {
        (self)().and_then(Credential::new)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<Credential>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Credential::new(token))
    }

    pub fn absent() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn current(&self) -> Option<Credential> {
        self.0.clone()
    }
}

/// Reads an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvCredential {
    fn current(&self) -> Option<Credential> {
        std::env::var(&self.var).ok().and_then(Credential::new)
    }
}

/// Reads a token file on every call. A missing file means signed out.
#[derive(Debug, Clone)]
pub struct FileCredential {
    path: PathBuf,
}

impl FileCredential {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredential {
    fn current(&self) -> Option<Credential> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Credential::new(contents),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no token file");
                None
            }
        }
    }
}

/// Tries each source in order; the first present credential wins.
pub struct FallbackCredential {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl FallbackCredential {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }
}

impl CredentialSource for FallbackCredential {
    fn current(&self) -> Option<Credential> {
        self.sources.iter().find_map(|source| source.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn blank_tokens_are_absent() {
        assert!(Credential::new("   \n").is_none());
        assert!(StaticCredential::new("").current().is_none());
        assert_eq!(
            StaticCredential::new(" abc \n").current().unwrap().token(),
            "abc"
        );
    }

    #[test]
    fn debug_output_redacts_token() {
        let cred = Credential::new("secret-jwt").unwrap();
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.bearer_header(), "Bearer secret-jwt");
    }

    #[test]
    fn closure_source_is_read_on_every_call() {
        let slot = Arc::new(Mutex::new(None::<String>));
        let source = {
            let slot = slot.clone();
            move || slot.lock().unwrap().clone()
        };
        assert!(source.current().is_none());
        *slot.lock().unwrap() = Some("t1".into());
        assert_eq!(source.current().unwrap().token(), "t1");
        *slot.lock().unwrap() = Some("t2".into());
        assert_eq!(source.current().unwrap().token(), "t2");
    }

    #[test]
    fn file_source_tracks_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jwt-token");
        let source = FileCredential::new(&path);
        assert!(source.current().is_none());

        std::fs::write(&path, "jwt-1\n").unwrap();
        assert_eq!(source.current().unwrap().token(), "jwt-1");

        std::fs::remove_file(&path).unwrap();
        assert!(source.current().is_none());
    }

    #[test]
    fn fallback_uses_first_present_source() {
        let source = FallbackCredential::new(vec![
            Box::new(StaticCredential::absent()),
            Box::new(StaticCredential::new("second")),
            Box::new(StaticCredential::new("third")),
        ]);
        assert_eq!(source.current().unwrap().token(), "second");
    }
}
