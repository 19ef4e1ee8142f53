use convert_case::{Case, Casing};

/// Kubernetes rejects any object name that is not a valid RFC 1123 DNS
/// label, with the following message from the API server:
///
/// ```text
/// a DNS-1123 label must consist of lower case alphanumeric characters or '-',
/// start with an alphanumeric character, and end with an alphanumeric
/// character (e.g. 'my-name', or '123-abc', regex used for validation is
/// '[a-z0-9]([-a-z0-9]*[a-z0-9])?')
/// ```
///
/// Please see [validation.go](https://github.com/kubernetes/kubernetes/blob/f3b98a08b05257fbc3c19b52ced70ea67c546b1e/staging/src/k8s.io/apimachinery/pkg/util/validation/validation.go)
/// for K8s own implementation of this check.
pub const MAX_LABEL_LEN: usize = 63;

const DEFAULT_IF_INVALID_FRAGMENT: &str = "unnamed";

/// rfc1123_fragment normalizes an arbitrary string into a fragment that may
/// be joined into an RFC 1123 compliant pod name.
///
/// Normalization:
/// * 1. All non-alphanumeric characters are converted to a space character.
///     * 1a. E.G. "Build Agent v.1.2" is converted to "Build Agent v 1 2".
/// * 2. The result of #1 is converted to a lowercase "kebab".
///     * 2a. E.G. "build-agent-v-1-2".
///     * 2b. If the result of #2 is empty, then "unnamed" is used instead.
///
/// Unlike a random suffix scheme, this normalization is DETERMINISTIC: the
/// same input always yields the same fragment. Agent pod names must be
/// recomputable from bead coordinates on every pass, so no entropy may be
/// mixed in here.
pub fn rfc1123_fragment<T: AsRef<str>>(raw: T) -> String {
    let fragment = raw
        .as_ref()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_case(Case::Kebab);
    if fragment.is_empty() {
        return DEFAULT_IF_INVALID_FRAGMENT.to_string();
    }
    fragment
}

/// clamp_label truncates a joined name down to the [63 byte](MAX_LABEL_LEN)
/// limit imposed on DNS labels, making sure that the truncation itself does
/// not strand a trailing hyphen (which would fail validation all over
/// again).
pub fn clamp_label<T: AsRef<str>>(name: T) -> String {
    let mut name = name.as_ref().to_string();
    if name.len() > MAX_LABEL_LEN {
        name.truncate(MAX_LABEL_LEN);
    }
    while name.ends_with('-') {
        name.pop();
    }
    name
}
