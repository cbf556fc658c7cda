use std::path::{Path, PathBuf};

/// Picks a target path in `dir` that does not collide with an existing
/// file.
///
/// `requested` is used as-is when free; otherwise `name (k).ext` with the
/// least `k >= 1` not taken. Names without an extension become `name (k)`.
/// The check reads the directory state at call time, so callers should
/// invoke it at write time, not when metadata arrives.
pub fn unique_target_path(dir: &Path, requested: &str) -> PathBuf {
    let candidate = dir.join(requested);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(requested);
    for k in 1u32.. {
        let name = match ext {
            Some(ext) => format!("{stem} ({k}).{ext}"),
            None => format!("{stem} ({k})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 exhausted while probing for a free name");
}

/// Splits `name.ext`; dotfiles and bare names count as extension-less.
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(at) if at > 0 => (&name[..at], Some(&name[at + 1..])),
        _ => (name, None),
    }
}
