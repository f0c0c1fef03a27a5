use crate::catalog::AlbumKind;

/// Clean a path component by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
///
/// Names that would resolve outside their parent (`.`, `..`) or clean to
/// nothing become `_`.
pub fn clean_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Local directory holding shared albums, keeping them apart from personal
/// albums of the same name.
pub const SHARED_DIR: &str = "shared";

/// Name under which an item's album is tracked: the album name for personal
/// albums, `shared/<album>` for shared ones.
pub fn collection_name(kind: AlbumKind, album: &str) -> String {
    match kind {
        AlbumKind::Personal => album.to_string(),
        AlbumKind::Shared => format!("{}/{}", SHARED_DIR, album),
    }
}

/// Target path of an item relative to the sync root: `<album>/<filename>`
/// for personal albums, `shared/<album>/<filename>` for shared ones, or just
/// `<filename>` for items outside any album.
pub fn local_relative_path(kind: AlbumKind, album: &str, filename: &str) -> String {
    let file = clean_component(filename);
    if album.trim().is_empty() {
        return file;
    }
    match kind {
        AlbumKind::Personal => format!("{}/{}", clean_component(album), file),
        AlbumKind::Shared => format!("{}/{}/{}", SHARED_DIR, clean_component(album), file),
    }
}
