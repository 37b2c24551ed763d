// tests/downloads.rs

//! Download pipeline integration against a local HTTP fixture server:
//! round-trips, the per-fingerprint cache, the retry bound and
//! parallel sets.

use quarry::download::cached::CachingDownloader;
use quarry::{
    DownloadJob, DownloadOptions, Error, FileDownloader, ResourceLocks, SilentProgress,
};
use std::sync::Arc;

fn locks(dir: &std::path::Path) -> Arc<ResourceLocks> {
    Arc::new(ResourceLocks::new(dir.join("locks")).unwrap())
}

#[test]
fn test_round_trip_with_checksum() {
    let body = b"arbitrary artifact bytes \x00\x01\x02";
    let mut server = mockito::Server::new();
    let _m = server.mock("GET", "/blob").with_body(body.as_slice()).create();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");
    let options = DownloadOptions {
        sha256: Some(quarry::hash::sha256(body)),
        md5: Some(quarry::hash::md5(body)),
        ..Default::default()
    };

    FileDownloader::new()
        .unwrap()
        .download(
            &format!("{}/blob", server.url()),
            &dest,
            &options,
            &SilentProgress::new(),
        )
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[test]
fn test_caching_downloader_round_trip_and_hit() {
    let body = b"immutable revision-qualified artifact";
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/artifact")
        .with_body(body.as_slice())
        .expect(1)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let downloader = CachingDownloader::new(dir.path().join("dlcache"), locks(dir.path())).unwrap();
    let options = DownloadOptions {
        sha256: Some(quarry::hash::sha256(body)),
        ..Default::default()
    };
    let url = format!("{}/artifact", server.url());

    let first = dir.path().join("first");
    downloader
        .download(&url, &first, &options, &SilentProgress::new())
        .unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), body);

    // Delete the destination; the second fetch issues zero requests
    std::fs::remove_file(&first).unwrap();
    let second = dir.path().join("second");
    downloader
        .download(&url, &second, &options, &SilentProgress::new())
        .unwrap();
    assert_eq!(std::fs::read(&second).unwrap(), body);
    mock.assert();
}

#[test]
fn test_retry_bound_is_n_plus_one() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/flaky")
        .with_status(500)
        .expect(3)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let options = DownloadOptions {
        retry: 2,
        retry_wait: 0,
        ..Default::default()
    };

    let err = FileDownloader::new()
        .unwrap()
        .download(
            &format!("{}/flaky", server.url()),
            &dir.path().join("flaky"),
            &options,
            &SilentProgress::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // retry=2 means exactly three GETs, never more
    mock.assert();
}

#[test]
fn test_not_found_is_never_retried() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/gone")
        .with_status(404)
        .expect(1)
        .create();

    let options = DownloadOptions {
        retry: 5,
        ..Default::default()
    };
    let dir = tempfile::tempdir().unwrap();

    let err = FileDownloader::new()
        .unwrap()
        .download(
            &format!("{}/gone", server.url()),
            &dir.path().join("gone"),
            &options,
            &SilentProgress::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    mock.assert();
}

#[test]
fn test_parallel_set_downloads_everything() {
    let mut server = mockito::Server::new();
    let mut jobs = Vec::new();
    let mut mocks = Vec::new();
    let dir = tempfile::tempdir().unwrap();

    for i in 0..6 {
        let path = format!("/file-{}", i);
        let body = format!("contents of file {}", i);
        mocks.push(server.mock("GET", path.as_str()).with_body(&body).create());
        jobs.push(DownloadJob {
            url: format!("{}{}", server.url(), path),
            dest: dir.path().join(format!("file-{}", i)),
            options: DownloadOptions::default(),
        });
    }

    FileDownloader::new()
        .unwrap()
        .download_set(&jobs, true, &SilentProgress::new())
        .unwrap();

    for i in 0..6 {
        let contents = std::fs::read_to_string(dir.path().join(format!("file-{}", i))).unwrap();
        assert_eq!(contents, format!("contents of file {}", i));
    }
}

#[test]
fn test_parallel_set_propagates_failure_after_join() {
    let mut server = mockito::Server::new();
    let _ok = server.mock("GET", "/good").with_body("fine").create();
    let _bad = server.mock("GET", "/bad").with_status(404).create();

    let dir = tempfile::tempdir().unwrap();
    let no_retry = DownloadOptions {
        retry: 0,
        ..Default::default()
    };
    let jobs = vec![
        DownloadJob {
            url: format!("{}/good", server.url()),
            dest: dir.path().join("good"),
            options: no_retry.clone(),
        },
        DownloadJob {
            url: format!("{}/bad", server.url()),
            dest: dir.path().join("bad"),
            options: no_retry,
        },
    ];

    let err = FileDownloader::new()
        .unwrap()
        .download_set(&jobs, true, &SilentProgress::new())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn test_resume_yields_identical_bytes() {
    // A download aborted after k bytes, resumed over HTTP ranges, must
    // produce the same file as an uninterrupted download
    let full: Vec<u8> = (0..=255u8).collect();
    let k = 100;

    let mut server = mockito::Server::new();
    let _whole_mock = server
        .mock("GET", "/whole")
        .with_body(full.as_slice())
        .create();
    // The partial endpoint only answers ranged requests: a fresh
    // (non-resuming) fetch of it would fail
    let ranged = server
        .mock("GET", "/part")
        .match_header("range", format!("bytes={}-", k).as_str())
        .with_status(206)
        .with_header(
            "Content-Range",
            &format!("bytes {}-{}/{}", k, full.len() - 1, full.len()),
        )
        .with_body(&full[k..])
        .expect(1)
        .create();

    let downloader = FileDownloader::new().unwrap();
    let dir = tempfile::tempdir().unwrap();

    // Uninterrupted download
    let whole = dir.path().join("whole");
    downloader
        .download(
            &format!("{}/whole", server.url()),
            &whole,
            &DownloadOptions::default(),
            &SilentProgress::new(),
        )
        .unwrap();

    // Interrupted download: k bytes already on disk, resume fetches the rest
    let resumed = dir.path().join("resumed");
    std::fs::write(&resumed, &full[..k]).unwrap();
    let options = DownloadOptions {
        resume: true,
        sha256: Some(quarry::hash::sha256(&full)),
        ..Default::default()
    };
    downloader
        .download(
            &format!("{}/part", server.url()),
            &resumed,
            &options,
            &SilentProgress::new(),
        )
        .unwrap();

    assert_eq!(std::fs::read(&whole).unwrap(), std::fs::read(&resumed).unwrap());
    ranged.assert();
}
