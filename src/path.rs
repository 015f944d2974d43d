//! Parsing of pinned repository paths.
//!
//! A pinned path has the shape `/<owner>/<repo>/<commit>[/<subpath>]` where
//! `<commit>` is a full 40-character hexadecimal object id.  Anything else is
//! rejected outright; callers answer with "not found" and stop.

/// Length of a full SHA-1 object id in hex.
pub const COMMIT_HASH_LEN: usize = 40;

/// Components of a pinned request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTriple {
    pub owner: String,
    pub repo: String,
    pub commit_hash: String,
    /// Remainder of the path after the commit, always starting with `/`.
    pub subpath: String,
}

impl PathTriple {
    /// Parse a request path (without query string).
    ///
    /// Returns `None` unless the path is exactly
    /// `/<owner>/<repo>/<40-hex>` optionally followed by `/<anything>`.
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        let mut parts = rest.splitn(4, '/');

        let owner = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        let commit_hash = parts.next().filter(|s| is_commit_hash(s))?;
        let subpath = match parts.next() {
            Some(tail) => format!("/{tail}"),
            None => "/".to_string(),
        };

        Some(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            commit_hash: commit_hash.to_string(),
            subpath,
        })
    }

    /// `owner/repo`
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Path of the same resource on the upstream host.
    pub fn upstream_path(&self) -> String {
        format!("/{}/{}{}", self.owner, self.repo, self.subpath)
    }

    /// Import path recorded for discovery, e.g.
    /// `github.com/owner/repo/<commit>`.
    pub fn import_path(&self, upstream_host: &str) -> String {
        format!(
            "{upstream_host}/{}/{}/{}",
            self.owner, self.repo, self.commit_hash
        )
    }

    /// Path on this server that tooling should fetch the repository from.
    pub fn repo_location(&self, upstream_host: &str) -> String {
        format!("/{}", self.import_path(upstream_host))
    }

    /// Whether this is the smart-HTTP reference advertisement endpoint.
    pub fn is_ref_advertisement(&self) -> bool {
        self.subpath == "/info/refs"
    }
}

fn is_commit_hash(s: &str) -> bool {
    s.len() == COMMIT_HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn rejects_short_hash() {
        assert_eq!(PathTriple::parse("/owner/repo/abc123"), None);
    }

    #[test]
    fn rejects_non_hex_and_overlong_hash() {
        let bad = "g123456789abcdef0123456789abcdef01234567";
        assert_eq!(PathTriple::parse(&format!("/owner/repo/{bad}")), None);
        assert_eq!(PathTriple::parse(&format!("/owner/repo/{HASH}0")), None);
    }

    #[test]
    fn rejects_missing_components() {
        assert_eq!(PathTriple::parse(&format!("//repo/{HASH}")), None);
        assert_eq!(PathTriple::parse(&format!("/owner//{HASH}")), None);
        assert_eq!(PathTriple::parse(&format!("owner/repo/{HASH}")), None);
        assert_eq!(PathTriple::parse("/owner/repo"), None);
    }

    #[test]
    fn accepts_bare_hash_with_root_subpath() {
        let triple = PathTriple::parse(&format!("/owner/repo/{HASH}")).unwrap();
        assert_eq!(triple.owner, "owner");
        assert_eq!(triple.repo, "repo");
        assert_eq!(triple.commit_hash, HASH);
        assert_eq!(triple.subpath, "/");
    }

    #[test]
    fn accepts_subpath() {
        let triple = PathTriple::parse(&format!("/owner/repo/{HASH}/sub/path")).unwrap();
        assert_eq!(triple.subpath, "/sub/path");
        assert_eq!(triple.upstream_path(), "/owner/repo/sub/path");
        assert!(!triple.is_ref_advertisement());
    }

    #[test]
    fn hash_is_case_insensitive() {
        let upper = HASH.to_ascii_uppercase();
        let triple = PathTriple::parse(&format!("/owner/repo/{upper}/info/refs")).unwrap();
        assert_eq!(triple.commit_hash, upper);
        assert!(triple.is_ref_advertisement());
    }

    #[test]
    fn derived_paths() {
        let triple = PathTriple::parse(&format!("/myorg/myrepo/{HASH}")).unwrap();
        assert_eq!(triple.repo_slug(), "myorg/myrepo");
        assert_eq!(
            triple.import_path("github.com"),
            format!("github.com/myorg/myrepo/{HASH}")
        );
        assert_eq!(
            triple.repo_location("github.com"),
            format!("/github.com/myorg/myrepo/{HASH}")
        );
    }
}
