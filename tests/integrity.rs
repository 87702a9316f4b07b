mod common;

use common::*;

use anyhow::Result;
use assert_matches::assert_matches;
use tempfile::TempDir;
use wim::{Compression, OpenFlag, Wim, WimError, WriteFlag, WriteOptions};

fn checked_opts() -> WriteOptions {
    WriteOptions::new()
        .compression(Some(Compression::Xpress))
        .threads(1)
        .flag(WriteFlag::CheckIntegrity)
}

/// A checked archive verifies cleanly on open.
#[test]
fn integrity_verifies_after_write() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("checked.wim");

    let mut wim = new_wim();
    wim.add_stream(mem_stream(compressible_bytes(1, 200_000)));
    wim.add_stream(mem_stream(incompressible_bytes(80_000)));
    wim.write_to(&path, &checked_opts())?;

    Wim::open_with_options(&path, OpenFlag::CheckIntegrity.into())?;
    Ok(())
}

/// Flipping one payload byte is caught by the integrity check (the
/// per-stream digests stay silent until the stream is actually read).
#[test]
fn tampered_payload_is_detected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("tampered.wim");

    let mut wim = new_wim();
    wim.add_stream(mem_stream(compressible_bytes(2, 150_000)));
    wim.write_to(&path, &checked_opts())?;

    let entry = wim.streams()[0].output_entry().copied().expect("written");
    let mut bytes = std::fs::read(&path)?;
    let victim = entry.offset as usize + entry.size_in_wim as usize / 2;
    bytes[victim] ^= 0x40;
    std::fs::write(&path, &bytes)?;

    // Without the check the archive still opens.
    Wim::open(&path)?;
    let err = Wim::open_with_options(&path, OpenFlag::CheckIntegrity.into()).unwrap_err();
    assert_matches!(err, WimError::Integrity { .. });
    Ok(())
}

/// An append extends the integrity table, reusing digests for the
/// untouched leading chunks, and the result still verifies.
#[test]
fn append_extends_integrity_table() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("reuse.wim");

    // Incompressible payload well past one 10 MiB integrity chunk, so the
    // append actually has leading digests to reuse.
    let mut wim = new_wim();
    wim.add_stream(mem_stream(incompressible_bytes(11 * 1024 * 1024)));
    wim.write_to(&path, &checked_opts())?;

    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    let extra = compressible_bytes(3, 500_000);
    let added = wim.add_stream(mem_stream(extra.clone()));
    wim.overwrite(&checked_opts())?;

    let mut reopened = Wim::open_with_options(&path, OpenFlag::CheckIntegrity.into())?;
    register_codecs(&mut reopened);
    assert_eq!(reopened.read_stream(&wim.streams()[added].hash)?, extra);
    Ok(())
}

/// Dropping the integrity flag on an unchanged overwrite removes the
/// table; adding it to an unchecked archive creates one.
#[test]
fn integrity_follows_the_write_flags() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("toggle.wim");

    let mut wim = new_wim();
    wim.add_stream(mem_stream(compressible_bytes(4, 50_000)));
    wim.write_to(
        &path,
        &WriteOptions::new()
            .compression(Some(Compression::Xpress))
            .threads(1),
    )?;

    // Turn checking on via an overwrite.
    let mut wim = Wim::open(&path)?;
    register_codecs(&mut wim);
    wim.overwrite(&checked_opts())?;
    Wim::open_with_options(&path, OpenFlag::CheckIntegrity.into())?;
    Ok(())
}
