//! Fixtures for the integration tests.

use station_flow::config::StationConfig;
use std::fs;
use std::path::Path;

/// Write a mono 16-bit PCM WAV of silence, `secs` long.
pub fn write_wav(path: &Path, secs: f32) {
    let sample_rate: u32 = 8000;
    let frames = (sample_rate as f32 * secs).round() as u32;
    let data_len = frames * 2;

    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(44 + data_len as usize, 0);

    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

/// A fast station config rooted in `root`: no fades, short ticks, and a
/// tool directory that does not exist unless a test fills it.
pub fn station_config(root: &Path) -> StationConfig {
    let mut config = StationConfig::default();
    config.paths.lib = root.join("lib");
    config.paths.bin = root.join("bin");
    config.paths.db = root.join("db.json");
    config.audio.formats = vec!["wav".into()];
    config.audio.transition_ms = 0;
    config.audio.id_poll_ms = 5;
    config.audio.tick_ms = 10;
    config.loudness.workers = 2;
    config.loudness.worker_timeout_secs = 10;
    config
}

/// Three show files and one station ID, all short.
pub fn seed_library(lib: &Path) {
    for name in ["a.wav", "b.wav", "c.wav"] {
        write_wav(&lib.join("show").join(name), 0.05);
    }
    write_wav(&lib.join("stationID").join("id.wav"), 0.05);
}

/// Install an executable shell script as `<dir>/<name>`.
#[cfg(unix)]
pub fn install_script(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}
