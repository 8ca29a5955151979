//! Image version ordering.
//!
//! Tags are read as dot/dash separated segments (`develop-1234.5` is branch
//! `develop`, build `1234`, sub-build `5`). Two images are only comparable
//! when they share a repository.

/// Parse an image reference into (repository, tag) components
pub fn parse_image(image: &str) -> (&str, &str) {
    // Handle digest references (image@sha256:...)
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos + 1..]);
    }

    // localhost:5000/myimage:tag has a registry port before the last slash
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }

    (image, "latest")
}

fn segments(tag: &str) -> impl Iterator<Item = &str> {
    tag.split(['.', '-'])
}

/// `true` when `a` is strictly older than `b`.
///
/// Images from different repositories are never older than each other. Within
/// a repository, segments are compared left to right: equal segments are
/// skipped, numeric segments compare by value and any other difference makes
/// the pair incomparable. When one tag is a prefix of the other the shorter
/// one is older.
pub fn is_older(a: &str, b: &str) -> bool {
    let (repo_a, tag_a) = parse_image(a);
    let (repo_b, tag_b) = parse_image(b);
    if repo_a != repo_b {
        return false;
    }

    let mut left = segments(tag_a);
    let mut right = segments(tag_b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return false,
            (None, Some(_)) => return true,
            (Some(_), None) => return false,
            (Some(l), Some(r)) if l == r => continue,
            (Some(l), Some(r)) => {
                return match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l < r,
                    _ => false,
                };
            }
        }
    }
}
