use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArchiveKind {
    TarGz,
    Zip,
}

/// Detect the archive format from its leading bytes.
///
/// Resolved download URLs are often opaque, so the file name is not trusted.
pub(crate) fn sniff_archive(path: &Path) -> io::Result<Option<ArchiveKind>> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < magic.len() {
        let read = file.read(&mut magic[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(match &magic[..filled] {
        [0x50, 0x4b, 0x03, 0x04] | [0x50, 0x4b, 0x05, 0x06] => Some(ArchiveKind::Zip),
        [0x1f, 0x8b, ..] => Some(ArchiveKind::TarGz),
        _ => None,
    })
}

/// Unpack `archive` into `dest`. Both formats refuse entries that would land
/// outside `dest`.
pub(crate) fn extract_archive(archive: &Path, dest: &Path) -> Result<(), String> {
    let kind = sniff_archive(archive)
        .map_err(|err| format!("reading {}: {err}", archive.display()))?
        .ok_or_else(|| "unsupported archive format (expected zip or tar.gz)".to_string())?;
    let file =
        File::open(archive).map_err(|err| format!("opening {}: {err}", archive.display()))?;
    match kind {
        ArchiveKind::TarGz => {
            let mut tar = Archive::new(GzDecoder::new(file));
            tar.set_preserve_permissions(true);
            tar.unpack(dest)
                .map_err(|err| format!("unpacking tar.gz into {}: {err}", dest.display()))?;
        }
        ArchiveKind::Zip => {
            let mut zip = ZipArchive::new(file).map_err(|err| format!("reading zip: {err}"))?;
            zip.extract(dest)
                .map_err(|err| format!("unpacking zip into {}: {err}", dest.display()))?;
        }
    }
    Ok(())
}
