mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use content_store::codec::gzip::{self, ContentEncoding};
use content_store::mime::MimeRegistry;
use content_store::store::{
    ContentStore, ObjectListener, Representation, StoreError, UploadRequest, UploadTarget,
};

use common::{HELLO, HELLO_LOCATION};

fn test_store() -> (tempfile::TempDir, ContentStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path().join("data"), Arc::new(MimeRegistry::builtin())).unwrap();
    (dir, store)
}

fn post(directory: &str, content_type: &str, encoding: ContentEncoding) -> UploadRequest {
    UploadRequest {
        target: UploadTarget::directory(directory).unwrap(),
        content_type: Some(content_type.to_string()),
        encoding,
    }
}

fn put(location: &str) -> UploadRequest {
    UploadRequest {
        target: UploadTarget::exact(location).unwrap(),
        content_type: Some("application/octet-stream".to_string()),
        encoding: ContentEncoding::Identity,
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl ObjectListener for Recorder {
    fn object_stored(&self, stored_path: &str) {
        self.0.lock().unwrap().push(stored_path.to_string());
    }
}

#[tokio::test]
async fn test_store_derives_location_from_content() {
    let (_dir, store) = test_store();

    let stored = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    assert_eq!(stored.location, HELLO_LOCATION);
    assert_eq!(stored.stored_path, HELLO_LOCATION);
    assert!(stored.new_object);
    assert_eq!(std::fs::read(store.disk_path(HELLO_LOCATION)).unwrap(), HELLO);
}

#[tokio::test]
async fn test_duplicate_upload_returns_same_location() {
    let (_dir, store) = test_store();
    let recorder = Arc::new(Recorder::default());
    let store = store.with_listener(recorder.clone());

    let first = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();
    let second = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    assert_eq!(first.location, second.location);
    assert!(first.new_object);
    assert!(!second.new_object);
    assert_eq!(*recorder.0.lock().unwrap(), vec![HELLO_LOCATION.to_string()]);
}

#[tokio::test]
async fn test_unknown_type_has_no_extension() {
    let (_dir, store) = test_store();

    let stored = store
        .store_bytes(
            post("/foo", "application/x-unheard-of", ContentEncoding::Identity),
            Bytes::from_static(HELLO),
        )
        .await
        .unwrap();

    assert_eq!(stored.location, "/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH");
}

#[tokio::test]
async fn test_empty_directory_uses_default() {
    let (_dir, store) = test_store();

    let stored = store
        .store_bytes(post("/", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    assert!(stored.location.starts_with("/default/VK/"));
}

#[tokio::test]
async fn test_collision_probes_next_slot() {
    let (_dir, store) = test_store();
    let occupied = store.disk_path(HELLO_LOCATION);
    std::fs::create_dir_all(occupied.parent().unwrap()).unwrap();
    std::fs::write(&occupied, b"something else entirely").unwrap();

    let stored = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();
    assert_eq!(stored.location, "/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH_2.txt");
    assert!(stored.new_object);

    // the probe settles on the byte-identical copy from then on
    let again = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();
    assert_eq!(again.location, stored.location);
    assert!(!again.new_object);
    assert_eq!(std::fs::read(&occupied).unwrap(), b"something else entirely");
}

#[tokio::test]
async fn test_gzip_transfer_is_stored_compressed() {
    let (_dir, store) = test_store();
    let wire = gzip::compress(HELLO).unwrap();

    let stored = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Gzip), Bytes::from(wire.clone()))
        .await
        .unwrap();

    assert_eq!(stored.location, HELLO_LOCATION);
    assert_eq!(stored.stored_path, format!("{HELLO_LOCATION}.gz"));
    assert!(!store.disk_path(HELLO_LOCATION).exists());
    assert_eq!(std::fs::read(store.disk_path(&stored.stored_path)).unwrap(), wire);
}

#[tokio::test]
async fn test_plain_and_compressed_uploads_share_location() {
    let (_dir, store) = test_store();

    let compressed = store
        .store_bytes(
            post("/foo", "text/plain", ContentEncoding::Gzip),
            Bytes::from(gzip::compress(HELLO).unwrap()),
        )
        .await
        .unwrap();
    let plain = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    assert_eq!(plain.location, compressed.location);
    assert!(!plain.new_object);
    assert_eq!(plain.stored_path, compressed.stored_path);
    assert!(!store.disk_path(HELLO_LOCATION).exists());
}

#[tokio::test]
async fn test_gzip_file_is_stored_as_uploaded() {
    let (_dir, store) = test_store();
    let artifact = gzip::compress(HELLO).unwrap();

    let stored = store
        .store_bytes(
            post("/foo", "application/gzip", ContentEncoding::Identity),
            Bytes::from(artifact.clone()),
        )
        .await
        .unwrap();

    // named by the hash of what is inside the archive
    assert_eq!(stored.location, "/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH.gz");
    assert_eq!(stored.stored_path, stored.location);
    assert_eq!(std::fs::read(store.disk_path(&stored.location)).unwrap(), artifact);
}

#[tokio::test]
async fn test_gzip_file_sent_gzipped_keeps_one_layer() {
    let (_dir, store) = test_store();
    let artifact = gzip::compress(HELLO).unwrap();

    let stored = store
        .store_bytes(
            post("/foo", "application/gzip", ContentEncoding::Gzip),
            Bytes::from(gzip::compress(&artifact).unwrap()),
        )
        .await
        .unwrap();

    assert_eq!(stored.location, "/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH.gz");
    assert_eq!(std::fs::read(store.disk_path(&stored.location)).unwrap(), artifact);
}

#[tokio::test]
async fn test_corrupt_transfer_encoding_is_rejected() {
    let (dir, store) = test_store();

    let result = store
        .store_bytes(
            post("/foo", "text/plain", ContentEncoding::Gzip),
            Bytes::from_static(b"definitely not gzip"),
        )
        .await;

    assert!(matches!(result, Err(StoreError::Decompression(_))));
    assert!(common::temp_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_upload_size_limit() {
    let (dir, store) = test_store();
    let store = store.with_max_upload_size(Some(4));

    let result = store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await;

    assert!(matches!(result, Err(StoreError::PayloadTooLarge(4))));
    assert!(common::temp_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_put_at_exact_location() {
    let (_dir, store) = test_store();

    let stored = store.store_bytes(put(HELLO_LOCATION), Bytes::from_static(HELLO)).await.unwrap();
    assert_eq!(stored.location, HELLO_LOCATION);
    assert!(stored.new_object);

    let again = store.store_bytes(put(HELLO_LOCATION), Bytes::from_static(HELLO)).await.unwrap();
    assert!(!again.new_object);
}

#[tokio::test]
async fn test_put_with_wrong_hash_is_rejected() {
    let (_dir, store) = test_store();

    let result = store
        .store_bytes(put(HELLO_LOCATION), Bytes::from_static(b"goodbye world\n"))
        .await;

    assert!(matches!(result, Err(StoreError::WrongLocation(_))));
    assert!(!store.disk_path(HELLO_LOCATION).exists());
}

#[tokio::test]
async fn test_put_into_occupied_slot_conflicts() {
    let (_dir, store) = test_store();
    let occupied = store.disk_path(HELLO_LOCATION);
    std::fs::create_dir_all(occupied.parent().unwrap()).unwrap();
    std::fs::write(&occupied, b"something else entirely").unwrap();

    let result = store.store_bytes(put(HELLO_LOCATION), Bytes::from_static(HELLO)).await;

    assert!(matches!(result, Err(StoreError::SlotConflict(_))));
}

#[tokio::test]
async fn test_put_rejects_malformed_paths() {
    assert!(matches!(UploadTarget::exact("/foo/bar"), Err(StoreError::WrongLocation(_))));
    assert!(matches!(
        UploadTarget::exact("/foo/_upload1/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH"),
        Err(StoreError::InvalidPath(_))
    ));
}

#[tokio::test]
async fn test_put_of_storage_compressed_bytes() {
    let (_dir, store) = test_store();

    // what a replicating peer sends for a `.txt.gz` file
    let stored = store
        .store_bytes(put(HELLO_LOCATION), Bytes::from(gzip::compress(HELLO).unwrap()))
        .await
        .unwrap();

    assert_eq!(stored.location, HELLO_LOCATION);
    assert_eq!(stored.stored_path, format!("{HELLO_LOCATION}.gz"));
}

#[tokio::test]
async fn test_put_of_storage_name_matches_raw_copy() {
    let (_dir, store) = test_store();
    store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    // the name a peer holding the compressed copy pushes under
    let stored = store
        .store_bytes(
            put(&format!("{HELLO_LOCATION}.gz")),
            Bytes::from(gzip::compress(HELLO).unwrap()),
        )
        .await
        .unwrap();

    assert!(!stored.new_object);
    assert_eq!(stored.location, HELLO_LOCATION);
    assert_eq!(stored.stored_path, HELLO_LOCATION);
    assert!(!store.disk_path(&format!("{HELLO_LOCATION}.gz")).exists());
    let files = std::fs::read_dir(store.disk_path("/foo/VK")).unwrap().count();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn test_put_of_storage_name_with_other_raw_content_conflicts() {
    let (_dir, store) = test_store();
    store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();
    std::fs::write(store.disk_path(HELLO_LOCATION), b"tampered\n").unwrap();

    let result = store
        .store_bytes(
            put(&format!("{HELLO_LOCATION}.gz")),
            Bytes::from(gzip::compress(HELLO).unwrap()),
        )
        .await;
    assert!(matches!(result, Err(StoreError::SlotConflict(_))));
}

#[tokio::test]
async fn test_lookup_variants() {
    let (_dir, store) = test_store();
    store
        .store_bytes(
            post("/foo", "text/plain", ContentEncoding::Gzip),
            Bytes::from(gzip::compress(HELLO).unwrap()),
        )
        .await
        .unwrap();

    let found = store.lookup(HELLO_LOCATION).await.unwrap().unwrap();
    assert_eq!(found.representation, Representation::StorageCompressed);
    assert_eq!(found.extension.as_deref(), Some("txt"));
    assert_eq!(found.etag, "\"VKIkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH\"");

    // the storage file itself, served as a gzip file
    let found = store.lookup(&format!("{HELLO_LOCATION}.gz")).await.unwrap().unwrap();
    assert_eq!(found.representation, Representation::Raw);
    assert_eq!(found.extension.as_deref(), Some("gz"));

    // no extension: any stored file with that stem
    let found = store
        .lookup("/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.representation, Representation::StorageCompressed);
    assert_eq!(found.extension.as_deref(), Some("txt"));

    assert!(store.lookup("/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH.html").await.unwrap().is_none());
    assert!(store.lookup("/foo/VK").await.unwrap().is_none());
    assert!(store.lookup("/").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_lines_echo_input() {
    let (_dir, store) = test_store();
    store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    let list = format!(
        "{HELLO_LOCATION}\r\n/foo/AB/missing\n\n/bar/CD/also-missing.txt.gz\r\n/foo/EF/unterminated"
    );
    let missing = store.missing_lines(list.as_bytes());

    assert_eq!(
        String::from_utf8(missing).unwrap(),
        "/foo/AB/missing\n\n/bar/CD/also-missing.txt.gz\r\n/foo/EF/unterminated"
    );
}

#[tokio::test]
async fn test_missing_lines_accept_storage_variant() {
    let (_dir, store) = test_store();
    store
        .store_bytes(
            post("/foo", "text/plain", ContentEncoding::Gzip),
            Bytes::from(gzip::compress(HELLO).unwrap()),
        )
        .await
        .unwrap();

    let list = format!("{HELLO_LOCATION}\n{HELLO_LOCATION}.gz\n");
    assert!(store.missing_lines(list.as_bytes()).is_empty());
}

#[tokio::test]
async fn test_missing_lines_accept_raw_copy_of_storage_name() {
    let (_dir, store) = test_store();
    store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();

    let list = format!("{HELLO_LOCATION}.gz\n");
    assert!(store.missing_lines(list.as_bytes()).is_empty());
    assert!(store.is_present(&format!("{HELLO_LOCATION}.gz")));
    assert!(!store.is_present("/.gz"));
}

#[tokio::test]
async fn test_enumerate_lists_stored_files() {
    let (_dir, store) = test_store();
    store
        .store_bytes(post("/foo", "text/plain", ContentEncoding::Identity), Bytes::from_static(HELLO))
        .await
        .unwrap();
    let compressed = store
        .store_bytes(
            post("/bar/baz", "text/html", ContentEncoding::Gzip),
            Bytes::from(gzip::compress(b"<p>hi</p>").unwrap()),
        )
        .await
        .unwrap();
    std::fs::write(store.root().join("foo").join("_upload42"), b"partial").unwrap();
    std::fs::write(store.root().join("stray.txt"), b"not an object").unwrap();

    let mut paths: Vec<String> = store.enumerate().map(Result::unwrap).collect();
    paths.sort();

    let mut expected = vec![HELLO_LOCATION.to_string(), compressed.stored_path];
    expected.sort();
    assert_eq!(paths, expected);
}

#[tokio::test]
async fn test_sweep_removes_abandoned_uploads() {
    let (_dir, store) = test_store();
    let pending = store.begin_upload("/foo").await.unwrap();
    std::fs::create_dir_all(store.root().join("bar")).unwrap();
    std::fs::write(store.root().join("bar").join("_upload7"), b"partial").unwrap();
    // a crashed process never gets to run destructors
    std::mem::forget(pending);

    assert_eq!(store.sweep_temp_files().unwrap(), 2);
    assert!(common::temp_files(store.root()).is_empty());
    assert_eq!(store.sweep_temp_files().unwrap(), 0);
}
