// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `docker save` import end-to-end: a constructed save tar materializes
//! into layer archives plus config.json, and the layers stack into a
//! readable filesystem.

use cc_oci::ImageStore;

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// A minimal legacy-format `docker save` tar with one layer.
fn build_save_tar() -> Vec<u8> {
    // Inner layer tar with /etc/os-release.
    let mut layer = tar::Builder::new(Vec::new());
    append_file(&mut layer, "etc/os-release", b"abcd\n");
    let layer_bytes = layer.into_inner().unwrap();

    let config = serde_json::json!({
        "architecture": "amd64",
        "config": {
            "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "Cmd": ["/bin/sh"],
            "WorkingDir": "/",
        }
    });
    let manifest = serde_json::json!([{
        "Config": "cfg.json",
        "RepoTags": ["test:latest"],
        "Layers": ["layer1/layer.tar"]
    }]);

    let mut save = tar::Builder::new(Vec::new());
    append_file(&mut save, "manifest.json", &serde_json::to_vec(&manifest).unwrap());
    append_file(&mut save, "cfg.json", &serde_json::to_vec(&config).unwrap());
    append_file(&mut save, "layer1/layer.tar", &layer_bytes);
    save.into_inner().unwrap()
}

#[test]
fn import_materializes_and_stacks() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("image.tar");
    std::fs::write(&tar_path, build_save_tar()).unwrap();

    let store = ImageStore::new(dir.path().join("cache"));
    let image = store.import_tar(&tar_path, "x86_64").unwrap();

    assert_eq!(image.config.layers.len(), 1);
    assert_eq!(image.config.cmd, vec!["/bin/sh"]);
    assert_eq!(image.config.architecture, "amd64");
    assert!(image.dir.join("config.json").exists());

    let stack = image.layer_stack().unwrap();
    let node = stack.lookup("/etc/os-release").unwrap();
    assert_eq!(node.read_all().unwrap(), b"abcd\n");
}

#[test]
fn import_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("image.tar");
    std::fs::write(&tar_path, build_save_tar()).unwrap();

    let store = ImageStore::new(dir.path().join("cache"));
    let first = store.import_tar(&tar_path, "x86_64").unwrap();
    let second = store.import_tar(&tar_path, "x86_64").unwrap();
    assert_eq!(first.config.layers, second.config.layers);
    assert_eq!(first.dir, second.dir);
}
