use std::io::Write;
use std::path::{Component, Path};
use std::rc::Rc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{is_dot_segment, Application};
use crate::cache::StaticEntry;

/// Extensions whose content is already compressed.
const COMPRESSED_EXT: &[&str] = &[
    "gif", "jpg", "jpe", "jpeg", "png", "svgz", "docx", "xlsx", "pptx", "dotx", "odm", "odt",
    "ott", "odp", "otp", "djvu", "djv", "zip", "rar", "z7", "gz", "jar", "arj", "iso", "nrg",
    "img", "apk", "mp2", "mp3", "mp4", "avi", "flv", "fla", "swf", "3gp", "mkv", "mpeg", "mpg",
    "mpe", "mov", "asf", "wmv", "vob",
];

pub fn is_compressed_ext(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| COMPRESSED_EXT.contains(&ext.as_str()))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

impl Application {
    /// Looks up `static/<url_path>`, reading and caching it on first use.
    /// Paths escaping the `static` directory never match.
    pub async fn static_file(&self, url_path: &str) -> Option<Rc<StaticEntry>> {
        let rel = Path::new(url_path.trim_start_matches('/'));
        if rel.as_os_str().is_empty()
            || rel.components().any(|c| !matches!(c, Component::Normal(_)))
            || url_path.split('/').any(is_dot_segment)
        {
            return None;
        }
        let key = format!("/static/{}", rel.to_string_lossy());
        if let Some(entry) = self.cache.get_static(&key) {
            return Some(entry);
        }

        let path = self.dir.join("static").join(rel);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(_) => {
                tracing::error!(app = %self.name, "Can't read file: {}", path.display());
                return None;
            }
        };

        let files = &self.config.files;
        let size = meta.len();
        let entry = if files.gzip && !is_compressed_ext(&path) && size > files.compress_above {
            match gzip(&data) {
                Ok(compressed) => StaticEntry {
                    data: Bytes::from(compressed),
                    compressed: true,
                    size,
                    modified: meta.modified().ok(),
                },
                Err(e) => {
                    tracing::error!(app = %self.name, "Can't compress {}: {}", path.display(), e);
                    return None;
                }
            }
        } else {
            StaticEntry {
                data: Bytes::from(data),
                compressed: false,
                size,
                modified: meta.modified().ok(),
            }
        };

        let parent = key.rsplit_once('/').map_or("/static", |(dir, _)| dir);
        self.watch_dir(parent);
        Some(self.cache.add_static(&key, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_extensions() {
        assert!(is_compressed_ext(Path::new("logo.PNG")));
        assert!(is_compressed_ext(Path::new("archive.gz")));
        assert!(!is_compressed_ext(Path::new("app.js")));
        assert!(!is_compressed_ext(Path::new("README")));
    }

    #[test]
    fn test_gzip_produces_gzip_stream() {
        let data = gzip(&[b'a'; 1024]).unwrap();
        assert_eq!(&data[..2], &[0x1f, 0x8b]);
        assert!(data.len() < 1024);
    }
}
