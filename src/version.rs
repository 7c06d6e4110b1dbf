//! Version derivation for generated addons.
//!
//! Upstream cores publish versions in every imaginable shape (`v081`,
//! `v1.3e`, `2.3.4-rc1`, `GIT`, ...). Addons need a plain
//! `MAJOR.MINOR.PATCH`, followed by a fourth component counting our own
//! releases of that upstream version.

use regex::Regex;
use std::sync::OnceLock;

/// Sentinel used by upstreams that never cut a formal release.
const UNVERSIONED: &str = "GIT";

/// Revision reported when no release tag is reachable yet.
pub const UNRELEASED_REVISION: &str = "-1";

fn letter_prefixed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z](0|[1-9][0-9]*)[._-]?([0-9]*)").expect("valid letter-prefixed regex")
    })
}

fn dotted_numeric() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9]+)(?:\.([0-9]+))?(?:\.([0-9]+))?").expect("valid dotted regex")
    })
}

fn release_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[0-9]+\.){3}([0-9]+)").expect("valid release tag regex"))
}

/// Strip leading zeros while keeping a lone `0`.
fn component(digits: &str) -> &str {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

/// Normalize an upstream version token into `MAJOR.MINOR.PATCH`.
///
/// Total: every input maps to some version, unparseable input to `0.0.0`.
///
/// ```ignore
/// assert_eq!(derive_addon_version("v081"), "0.81.0");
/// assert_eq!(derive_addon_version("2.3.4-rc1"), "2.3.4");
/// ```
pub fn derive_addon_version(raw: &str) -> String {
    let raw = raw.trim();

    if raw == UNVERSIONED {
        return "1.0.0".to_string();
    }

    if let Some(caps) = letter_prefixed().captures(raw) {
        // More than one separator: a dotted version behind a prefix letter
        if has_further_component(&raw[caps[0].len()..]) {
            return derive_dotted(&raw[1..]);
        }
        let major = component(&caps[1]);
        let minor = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let minor = if minor.is_empty() { "0" } else { component(minor) };
        return format!("{}.{}.0", major, minor);
    }

    derive_dotted(raw)
}

fn has_further_component(rest: &str) -> bool {
    let mut chars = rest.chars();
    matches!(chars.next(), Some('.' | '_' | '-'))
        && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn derive_dotted(raw: &str) -> String {
    match dotted_numeric().captures(raw) {
        Some(caps) => {
            let part = |idx: usize| caps.get(idx).map(|m| component(m.as_str())).unwrap_or("0");
            format!("{}.{}.{}", part(1), part(2), part(3))
        }
        None => "0.0.0".to_string(),
    }
}

/// Extract our package revision from `git describe` output.
///
/// Only tags shaped as a four-part dotted version count; anything else means
/// nothing was released yet and yields [`UNRELEASED_REVISION`].
pub fn derive_package_revision(describe: &str) -> String {
    release_tag()
        .captures(describe.trim())
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| UNRELEASED_REVISION.to_string())
}

/// Package revision for projects versioned by upstream tags.
///
/// Continues from the nearest release tag when it released the same
/// `addon_version`, starts at `0` otherwise.
pub fn derive_tagged_revision(addon_version: &str, describe: &str) -> String {
    let describe = describe.trim();
    let same_release = describe
        .strip_prefix(addon_version)
        .is_some_and(|rest| rest.starts_with('.'));
    let revision = derive_package_revision(describe);
    if same_release && revision != UNRELEASED_REVISION {
        revision
    } else {
        "0".to_string()
    }
}

/// Join an addon version and package revision.
pub fn full_version(addon_version: &str, revision: &str) -> String {
    format!("{}.{}", addon_version, revision)
}

/// Increment the last component of a dotted version (`1.2.3.-1` -> `1.2.3.0`).
pub fn bump_version(version: &str) -> String {
    let (base, last) = match version.rsplit_once('.') {
        Some(split) => split,
        None => return full_version(version, "0"),
    };
    let revision: i64 = last.parse().unwrap_or(-1);
    let next = revision.checked_add(1).unwrap_or(0);
    full_version(base, &next.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addon_version_patterns() {
        assert_eq!(derive_addon_version("GIT"), "1.0.0");
        assert_eq!(derive_addon_version("v081"), "0.81.0");
        assert_eq!(derive_addon_version("v10BETAXY"), "10.0.0");
        assert_eq!(derive_addon_version("v1.3e"), "1.3.0");
        assert_eq!(derive_addon_version("v12 ALPHA"), "12.0.0");
        assert_eq!(derive_addon_version("v2.5.0"), "2.5.0");
        assert_eq!(derive_addon_version("v2.5.7"), "2.5.7");
        assert_eq!(derive_addon_version("v0.9.44"), "0.9.44");
        assert_eq!(derive_addon_version("2"), "2.0.0");
        assert_eq!(derive_addon_version("2.3"), "2.3.0");
        assert_eq!(derive_addon_version("2.3.4"), "2.3.4");
    }

    #[test]
    fn test_addon_version_suffixes_ignored() {
        assert_eq!(derive_addon_version("2.3.4-rc1"), "2.3.4");
        assert_eq!(derive_addon_version("1.9+build.7"), "1.9.0");
        assert_eq!(derive_addon_version("0.9.41 WIP"), "0.9.41");
    }

    #[test]
    fn test_addon_version_unparseable() {
        assert_eq!(derive_addon_version(""), "0.0.0");
        assert_eq!(derive_addon_version("nightly"), "0.0.0");
        assert_eq!(derive_addon_version("-"), "0.0.0");
    }

    #[test]
    fn test_package_revision() {
        assert_eq!(derive_package_revision("1.2.3.4-2-g1234567"), "4");
        assert_eq!(derive_package_revision("1.2.3.17"), "17");
        assert_eq!(derive_package_revision("g1234567"), UNRELEASED_REVISION);
        assert_eq!(derive_package_revision(""), UNRELEASED_REVISION);
        assert_eq!(derive_package_revision("1.2.3-1-gabcdef0"), UNRELEASED_REVISION);
    }

    #[test]
    fn test_tagged_revision() {
        assert_eq!(derive_tagged_revision("2.5.0", "abcdef0"), "0");
        assert_eq!(derive_tagged_revision("2.5.0", "2.5.0.0"), "0");
        assert_eq!(derive_tagged_revision("2.5.0", "2.5.0.3-1-gabcdef0"), "3");
        assert_eq!(derive_tagged_revision("2.6.0", "2.5.0.3"), "0");
        assert_eq!(derive_tagged_revision("1.2.3", "1.2.30.4"), "0");
    }

    #[test]
    fn test_bump_version() {
        assert_eq!(bump_version("1.2.3.-1"), "1.2.3.0");
        assert_eq!(bump_version("1.2.3.4"), "1.2.3.5");
        assert_eq!(bump_version("1"), "1.0");
        assert_eq!(bump_version("1.2.3.9223372036854775807"), "1.2.3.0");
    }

    #[test]
    fn test_full_version() {
        let version = full_version(
            &derive_addon_version("v2.5.0"),
            &derive_package_revision("abc"),
        );
        assert_eq!(version, "2.5.0.-1");
        assert_eq!(bump_version(&version), "2.5.0.0");
    }
}
