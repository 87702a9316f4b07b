mod common;

use common::*;

use anyhow::Result;
use assert_matches::assert_matches;
use fs2::FileExt;
use tempfile::TempDir;
use wim::{Compression, OpenFlag, Wim, WimError, WriteFlag, WriteOptions};

fn opts() -> WriteOptions {
    WriteOptions::new()
        .compression(Some(Compression::Xpress))
        .threads(1)
}

fn build_archive(path: &std::path::Path, with_integrity: bool) -> Result<Wim> {
    let mut wim = new_wim();
    wim.add_stream(mem_stream(compressible_bytes(1, 150_000)));
    wim.add_stream(mem_stream(compressible_bytes(2, 90_000)));
    wim.add_image("base", mem_stream(compressible_bytes(3, 30_000)));
    let mut o = opts();
    if with_integrity {
        o = o.flag(WriteFlag::CheckIntegrity);
    }
    wim.write_to(path, &o)?;
    Ok(wim)
}

/// Appending adds bytes strictly after the old end of the archive; the
/// old bytes are untouched and the new tables land after the new stream.
#[test]
fn append_preserves_existing_bytes() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("grow.wim");
    build_archive(&path, true)?;
    let before = std::fs::read(&path)?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    let new_data = compressible_bytes(9, 2_000_000);
    let added = wim.add_stream(mem_stream(new_data.clone()));
    wim.add_image("layer", mem_stream(compressible_bytes(10, 20_000)));
    wim.overwrite(&opts().flag(WriteFlag::CheckIntegrity))?;

    // Everything the old archive consisted of is still there, bit for
    // bit.
    let after = std::fs::read(&path)?;
    assert!(after.len() > before.len());
    assert_eq!(&after[..before.len()], &before[..]);

    // The new stream begins past the old archive and the rewritten
    // lookup table lies beyond it.
    let new_entry = wim.streams()[added].output_entry().expect("written");
    assert!(new_entry.offset >= before.len() as u64);

    let reopened = Wim::open_with_options(&path, OpenFlag::CheckIntegrity.into())?;
    assert_eq!(reopened.image_count(), 2);
    let mut reopened = reopened;
    register_codecs(&mut reopened);
    assert_eq!(reopened.read_stream(&wim.streams()[added].hash)?, new_data);
    Ok(())
}

/// Overwriting with nothing changed rewrites only the trailing tables,
/// reproducing the file byte for byte.
#[test]
fn unchanged_overwrite_is_byte_stable() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("stable.wim");
    build_archive(&path, false)?;
    let before = std::fs::read(&path)?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    wim.overwrite(&opts())?;

    let after = std::fs::read(&path)?;
    assert_eq!(before, after);
    Ok(())
}

/// A failed append truncates the file back to its previous size; the
/// original archive survives untouched.
#[test]
fn failed_append_truncates_back() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("fail.wim");
    build_archive(&path, false)?;
    let before = std::fs::read(&path)?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    // The declared digest will not match what the source returns,
    // simulating a source that was tampered with mid-capture.
    wim.add_stream(wim::StreamDescriptor::with_hash(
        wim::StreamSource::Backend {
            backend: std::sync::Arc::new(MemoryStream(compressible_bytes(42, 100_000))),
        },
        100_000,
        [0x11; 20],
    ));

    let err = wim.overwrite(&opts()).unwrap_err();
    assert_matches!(err, WimError::InvalidResourceHash { .. });

    let after = std::fs::read(&path)?;
    assert_eq!(before, after);

    // And the archive still opens cleanly.
    Wim::open(&path)?;
    Ok(())
}

/// Deleting an image forces a rebuild, which drops the dead stream from
/// the file; soft deletion appends instead and leaves the bytes behind.
#[test]
fn deletion_policy() -> Result<()> {
    let dir = TempDir::new()?;

    // Hard delete: rebuild.
    let path = dir.path().join("hard.wim");
    build_archive(&path, false)?;
    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    assert_eq!(wim.image_count(), 1);
    wim.delete_image(1)?;
    wim.overwrite(&opts())?;

    let reopened = Wim::open(&path)?;
    assert_eq!(reopened.image_count(), 0);
    // The metadata stream is gone from the rebuilt file.
    assert_eq!(reopened.streams().len(), 2);

    // Soft delete: append-in-place keeps the old bytes around.
    let path = dir.path().join("soft.wim");
    build_archive(&path, false)?;
    let before_len = std::fs::metadata(&path)?.len();
    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    wim.delete_image(1)?;
    wim.overwrite(&opts().flag(WriteFlag::SoftDelete))?;

    assert!(std::fs::metadata(&path)?.len() >= before_len);
    let reopened = Wim::open(&path)?;
    assert_eq!(reopened.image_count(), 0);
    assert_eq!(reopened.streams().len(), 2);
    Ok(())
}

/// An explicit rebuild request is honored even when an append would have
/// been possible.
#[test]
fn rebuild_flag_forces_rebuild() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("rebuild.wim");
    build_archive(&path, false)?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    let data = compressible_bytes(5, 60_000);
    let added = wim.add_stream(mem_stream(data.clone()));
    wim.overwrite(&opts().flag(WriteFlag::Rebuild))?;

    let mut reopened = Wim::open(&path)?;
    register_codecs(&mut reopened);
    assert_eq!(reopened.streams().len(), 4);
    assert_eq!(reopened.read_stream(&wim.streams()[added].hash)?, data);
    Ok(())
}

/// Appending to an archive someone else holds locked is refused.
#[test]
fn locked_archive_is_refused() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("locked.wim");
    build_archive(&path, false)?;

    let holder = std::fs::File::open(&path)?;
    holder.lock_exclusive()?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    wim.add_stream(mem_stream(compressible_bytes(6, 10_000)));
    let err = wim.overwrite(&opts()).unwrap_err();
    assert_matches!(err, WimError::AlreadyLocked);

    holder.unlock()?;
    Ok(())
}

/// Appending cannot silently change the archive's codec.
#[test]
fn append_with_mismatched_codec_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("kind.wim");
    build_archive(&path, false)?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    wim.add_stream(mem_stream(compressible_bytes(7, 10_000)));
    let err = wim
        .overwrite(
            &WriteOptions::new()
                .compression(Some(Compression::Lzx))
                .threads(1),
        )
        .unwrap_err();
    assert_matches!(err, WimError::InvalidParam(_));
    Ok(())
}
