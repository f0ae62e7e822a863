use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rangedl::store::{BreakpointStore, JsonFileStore};
use rangedl::{
    BlockInfo, BreakpointInfo, ContentLength, DownloadConfig, DownloadContext, DownloadTask,
    Downloader, Error,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

const MIB: usize = 1024 * 1024;

type RangeLog = Arc<Mutex<Vec<Option<String>>>>;

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let ranges = value.strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = match end {
        "" => total - 1,
        end => end.parse::<usize>().ok()?.min(total - 1),
    };
    Some((start, end))
}

#[derive(Clone, Copy, Default)]
struct Behaviour {
    chunked: bool,
    /// The first response sends this many body bytes, then hangs.
    stall_first_after: Option<usize>,
    etag: Option<&'static str>,
}

async fn serve(body: Vec<u8>, chunked: bool) -> (SocketAddr, RangeLog) {
    serve_with(
        body,
        Behaviour {
            chunked,
            ..Behaviour::default()
        },
    )
    .await
}

/// Minimal HTTP/1.1 file server: honours `Range`, or answers chunked when asked to.
async fn serve_with(body: Vec<u8>, behaviour: Behaviour) -> (SocketAddr, RangeLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);
    let log: RangeLog = Arc::new(Mutex::new(vec![]));
    let requests = log.clone();
    let stalled = Arc::new(AtomicBool::new(false));
    let chunked = behaviour.chunked;
    let etag = behaviour
        .etag
        .map(|tag| format!("ETag: {}\r\n", tag))
        .unwrap_or_default();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            let requests = requests.clone();
            let stalled = stalled.clone();
            let etag = etag.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let range = request.lines().find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("range")
                        .then(|| value.trim().to_string())
                });
                requests.lock().unwrap().push(range.clone());

                let mut response = Vec::new();
                if chunked {
                    response.extend_from_slice(
                        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                    );
                    for piece in body.chunks(1000) {
                        response.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
                        response.extend_from_slice(piece);
                        response.extend_from_slice(b"\r\n");
                    }
                    response.extend_from_slice(b"0\r\n\r\n");
                } else if let Some((start, end)) =
                    range.as_deref().and_then(|r| parse_range(r, body.len()))
                {
                    response.extend_from_slice(
                        format!(
                            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n{}Connection: close\r\n\r\n",
                            end - start + 1,
                            start,
                            end,
                            body.len(),
                            etag
                        )
                        .as_bytes(),
                    );
                    response.extend_from_slice(&body[start..=end]);
                } else {
                    response.extend_from_slice(
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .as_bytes(),
                    );
                    response.extend_from_slice(&body);
                }
                if let Some(sent) = behaviour.stall_first_after {
                    if !stalled.swap(true, Ordering::SeqCst) {
                        let headers = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
                        let _ = socket.write_all(&response[..headers + sent]).await;
                        std::future::pending::<()>().await;
                    }
                }
                // The negotiating block hangs up early once it has its share.
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, log)
}

fn downloader(state_dir: &Path) -> Downloader {
    downloader_with(
        state_dir,
        DownloadConfig {
            max_blocks: 3,
            min_block_size: 0,
            ..DownloadConfig::default()
        },
    )
}

fn downloader_with(state_dir: &Path, config: DownloadConfig) -> Downloader {
    let context = DownloadContext::builder(config)
        .store(Arc::new(JsonFileStore::new(state_dir)))
        .build();
    Downloader::new(Arc::new(context)).unwrap()
}

fn task(addr: SocketAddr, dir: &Path) -> DownloadTask {
    let url = Url::parse(&format!("http://{}/files/data.bin", addr)).unwrap();
    DownloadTask::in_dir(url, dir)
}

#[tokio::test]
async fn download_splits_into_blocks() {
    let content = body(3 * MIB);
    let (addr, log) = serve(content.clone(), false).await;
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let task = task(addr, dir.path());

    let fetched = downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched, content.len() as u64);
    assert_eq!(std::fs::read(&task.path).unwrap(), content);

    let mut ranges: Vec<String> = log.lock().unwrap().iter().flatten().cloned().collect();
    ranges.sort();
    assert_eq!(ranges, vec!["bytes=0-", "bytes=1572864-3145727"]);

    let store = JsonFileStore::new(&state_dir);
    assert!(store.get(&task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn download_chunked_body_in_one_block() {
    let content = body(10_000);
    let (addr, log) = serve(content.clone(), true).await;
    let dir = tempfile::tempdir().unwrap();
    let task = task(addr, dir.path());

    let fetched = downloader(&dir.path().join("state"))
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched, 10_000);
    assert_eq!(std::fs::read(&task.path).unwrap(), content);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn download_resumes_from_breakpoint() {
    let content = body(3 * MIB);
    let half = content.len() / 2;
    let (addr, log) = serve(content.clone(), false).await;
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let task = task(addr, dir.path());

    // A previous run finished block 0 and 1000 bytes of block 1.
    std::fs::write(&task.path, &content[..half + 1000]).unwrap();
    let mut info = BreakpointInfo::new(task.id.clone(), task.url.clone(), task.path.clone());
    info.total_length = ContentLength::Known(content.len() as u64);
    info.reset_blocks();
    info.add_block(BlockInfo::new(0, half as u64));
    info.add_block(BlockInfo::new(half as u64, (content.len() - half) as u64));
    info.block_mut(0).unwrap().current_offset = half as u64;
    info.block_mut(1).unwrap().current_offset = 1000;
    assert!(JsonFileStore::new(&state_dir).update(&info).await);

    let fetched = downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched, (content.len() - half - 1000) as u64);
    assert_eq!(std::fs::read(&task.path).unwrap(), content);
    assert_eq!(
        *log.lock().unwrap(),
        vec![Some("bytes=1573864-3145727".to_string())]
    );
}

#[tokio::test]
async fn download_rejects_wrong_hash() {
    let content = body(1000);
    let (addr, _log) = serve(content, false).await;
    let dir = tempfile::tempdir().unwrap();
    let task = task(addr, dir.path()).with_sha256(Some("00".repeat(32)));

    let err = downloader(&dir.path().join("state"))
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HashMismatch { .. }));
    assert!(!task.path.exists());
}

#[tokio::test]
async fn download_cancelled_up_front() {
    let (addr, _log) = serve(body(1000), false).await;
    let dir = tempfile::tempdir().unwrap();
    let task = task(addr, dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = downloader(&dir.path().join("state"))
        .download(task, cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn download_keeps_progress_when_cancelled() {
    let content = body(512 * 1024);
    let sent = 300 * 1024;
    let (addr, log) = serve_with(
        content.clone(),
        Behaviour {
            stall_first_after: Some(sent),
            ..Behaviour::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let task = task(addr, dir.path());

    let cancel = CancellationToken::new();
    let cancel_once_stalled = async {
        for _ in 0..500 {
            let on_disk = std::fs::metadata(&task.path).map(|m| m.len()).unwrap_or(0);
            if on_disk >= sent as u64 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
    };
    let stalled_downloader = downloader(&state_dir);
    let (result, ()) = tokio::join!(
        stalled_downloader.download(task.clone(), cancel.clone()),
        cancel_once_stalled
    );
    assert!(result.unwrap_err().is_cancelled());

    let stored = JsonFileStore::new(&state_dir)
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.block_count(), 1);
    assert_eq!(stored.block(0).unwrap().current_offset, sent as u64);

    let fetched = downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched, (content.len() - sent) as u64);
    assert_eq!(std::fs::read(&task.path).unwrap(), content);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            Some("bytes=0-".to_string()),
            Some(format!("bytes={}-{}", sent, content.len() - 1)),
        ]
    );
}

#[tokio::test]
async fn download_lenient_first_block_is_finished_on_the_next_run() {
    let content = body(3 * MIB);
    let (addr, log) = serve(content.clone(), false).await;
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let task = task(addr, dir.path());

    // Block 0 is 1.5 MiB; this much slack lets it stop well short.
    let lenient = DownloadConfig {
        max_blocks: 3,
        min_block_size: 0,
        lenience_slack: 1_000_000,
        ..DownloadConfig::default()
    };
    let err = downloader_with(&state_dir, lenient)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IntegrityMismatch { expected, .. } if expected == 3 * MIB as u64));

    let stored = JsonFileStore::new(&state_dir)
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    let kept = stored.block(0).unwrap().current_offset;
    assert!(kept > 0 && kept < stored.block(0).unwrap().content_length);
    assert!(stored.block(1).unwrap().is_complete());

    let fetched = downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched, (3 * MIB / 2) as u64 - kept);
    assert_eq!(std::fs::read(&task.path).unwrap(), content);
    assert_eq!(
        log.lock().unwrap().last().cloned().flatten(),
        Some(format!("bytes={}-{}", kept, 3 * MIB / 2 - 1))
    );
}

#[tokio::test]
async fn download_drops_breakpoint_when_remote_changed() {
    let content = body(3 * MIB);
    let half = content.len() / 2;
    let (addr, _log) = serve_with(
        content.clone(),
        Behaviour {
            etag: Some("\"v2\""),
            ..Behaviour::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let task = task(addr, dir.path());

    std::fs::write(&task.path, &content[..1000]).unwrap();
    let mut info = BreakpointInfo::new(task.id.clone(), task.url.clone(), task.path.clone());
    info.total_length = ContentLength::Known(content.len() as u64);
    info.etag = Some("\"v1\"".to_string());
    info.reset_blocks();
    info.add_block(BlockInfo::new(0, half as u64));
    info.add_block(BlockInfo::new(half as u64, (content.len() - half) as u64));
    info.block_mut(0).unwrap().current_offset = 1000;
    let store = JsonFileStore::new(&state_dir);
    assert!(store.update(&info).await);

    let err = downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceChanged { .. }));
    assert!(store.get(&task.id).await.unwrap().is_none());

    // With the stale breakpoint gone the next run starts over.
    downloader(&state_dir)
        .download(task.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&task.path).unwrap(), content);
}
