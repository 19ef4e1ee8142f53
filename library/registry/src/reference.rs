use std::fmt::{Display, Formatter};

/// The registry host assumed when a reference does not carry one. This
/// mirrors the behavior of every mainstream container runtime.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// The tag assumed when a reference does not carry one.
pub const DEFAULT_TAG: &str = "latest";

/// A `Reference` is a parsed container-image reference of the general shape
/// `[registry[:port]/]repository[:tag][@digest]`.
///
/// The parse follows the runtime convention for deciding whether the first
/// path segment is a registry host: it is a host iff it contains a `.`, a
/// `:`, or is the literal `localhost`. A bare single-segment repository on
/// the default registry is prefixed with `library/`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl Reference {
    pub fn parse<T: AsRef<str>>(raw: T) -> Reference {
        let raw = raw.as_ref();
        // A digest pin, if present, always trails the reference.
        let (raw, digest) = match raw.split_once('@') {
            Some((head, digest)) => (head, Some(digest.to_string())),
            None => (raw, None),
        };
        let (registry, remainder) = match raw.split_once('/') {
            Some((head, tail)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                (head.to_string(), tail)
            }
            _ => (DEFAULT_REGISTRY.to_string(), raw),
        };
        // Only a colon AFTER the final slash separates a tag; a colon before
        // it would be a registry port, which was consumed above.
        let (repository, tag) = match remainder.rfind(':') {
            Some(at) if !remainder[at..].contains('/') => (
                remainder[..at].to_string(),
                remainder[at + 1..].to_string(),
            ),
            _ => (remainder.to_string(), DEFAULT_TAG.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        Reference {
            registry,
            repository,
            tag,
            digest,
        }
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = self.digest.as_ref() {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fully_qualified() {
        let got = Reference::parse("registry.kurl:5000/gasboat/coop:v1.2");
        let want = Reference {
            registry: "registry.kurl:5000".to_string(),
            repository: "gasboat/coop".to_string(),
            tag: "v1.2".to_string(),
            digest: None,
        };
        assert_eq!(want, got);
    }

    #[test]
    fn parse_untagged_defaults_to_latest() {
        let got = Reference::parse("ghcr.io/gasboat/coop");
        assert_eq!("latest", got.tag);
        assert_eq!("gasboat/coop", got.repository);
    }

    #[test]
    fn parse_bare_repository_goes_to_default_registry() {
        let got = Reference::parse("redis:6");
        assert_eq!(DEFAULT_REGISTRY, got.registry);
        assert_eq!("library/redis", got.repository);
        assert_eq!("6", got.tag);
    }

    #[test]
    fn parse_localhost_is_a_registry() {
        let got = Reference::parse("localhost/coop:dev");
        assert_eq!("localhost", got.registry);
        assert_eq!("coop", got.repository);
    }

    #[test]
    fn parse_digest_pin() {
        let got = Reference::parse(
            "reg.example.com/agent:latest@sha256:cb1ff0854b8864a6a68ee0b5e509d4d94c50a41f96dc2749ea71dc124c89d11f",
        );
        assert_eq!(
            Some(
                "sha256:cb1ff0854b8864a6a68ee0b5e509d4d94c50a41f96dc2749ea71dc124c89d11f"
                    .to_string()
            ),
            got.digest
        );
        assert_eq!("latest", got.tag);
    }

    #[test]
    fn round_trip_display() {
        let raw = "registry.kurl:5000/gasboat/coop:v1.2";
        assert_eq!(raw, format!("{}", Reference::parse(raw)));
    }
}
