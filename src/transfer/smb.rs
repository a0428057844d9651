use std::net::IpAddr;

/// Derives the folder path relative to the configured SMB share.
///
/// Operators often paste a full network path (`\\host\share\dir` or
/// `host/share/dir`) where the transfer tool wants a share-relative one. The
/// share is located among the path segments, exact match first and then
/// ignoring case and the characters `! . - _`; everything after it is kept.
/// When the share cannot be found the first segment is taken for the host and
/// dropped. A two-segment path of plain folder names is the one exception: it
/// is already share-relative.
pub fn share_relative_path(remote_path: &str, share: &str) -> String {
    let normalized = remote_path.trim().replace('\\', "/");
    let unc = normalized.starts_with("//");
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

    let has_host = unc || (segments.len() > 1 && segments.first().is_some_and(|s| looks_like_host(s)));
    let search_from = usize::from(has_host);

    if let Some(idx) = locate_share(&segments, search_from, share) {
        return segments[idx + 1..].join("/");
    }
    let skip = usize::from(has_host || segments.len() >= 3);
    segments[skip.min(segments.len())..].join("/")
}

/// IP addresses and dotted names such as `nas.local`.
fn looks_like_host(segment: &str) -> bool {
    segment.parse::<IpAddr>().is_ok() || segment.contains('.')
}

fn locate_share(segments: &[&str], from: usize, share: &str) -> Option<usize> {
    let share = share.trim();
    if share.is_empty() {
        return None;
    }
    let candidates = || segments.iter().enumerate().skip(from);

    if let Some((idx, _)) = candidates().find(|(_, s)| s.eq_ignore_ascii_case(share)) {
        return Some(idx);
    }

    let wanted = squash(share);
    if wanted.is_empty() {
        return None;
    }
    if let Some((idx, _)) = candidates().find(|(_, s)| squash(s) == wanted) {
        return Some(idx);
    }
    candidates()
        .find(|(_, s)| {
            let part = squash(s);
            !part.is_empty() && (part.contains(&wanted) || wanted.contains(&part))
        })
        .map(|(idx, _)| idx)
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '!' | '.' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}
