use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest_engine::hls::{
    FetchJob, HttpManifestSource, HttpSegmentDownloader, PlaylistResolver, SegmentClassifier,
    SegmentDownloader, SegmentOutcome,
};
use harvest_engine::workspace::JobWorkspace;
use harvest_engine::{
    AcquisitionOutcome, FailureKind, HarvestConfig, HarvestError, HlsHarvester, HttpClient, Muxer,
    NullSink, ProxyConfig, RetryPolicy, SegmentClass,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

fn config(root: &Path, concurrency: usize) -> HarvestConfig {
    HarvestConfig::builder()
        .concurrency(concurrency)
        .retry(fast_retry())
        .use_system_proxy(false)
        .workspace_root(root)
        .build()
}

fn ts_packet() -> Vec<u8> {
    let mut packet = vec![0xFFu8; 188];
    packet[0] = 0x47;
    packet
}

fn vod_playlist(count: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Keeps the concat list it was handed and writes it out as the "merged" file.
#[derive(Default)]
struct ListMuxer {
    lists: Mutex<Vec<String>>,
}

#[async_trait]
impl Muxer for ListMuxer {
    async fn mux(
        &self,
        concat_list: &Path,
        output: &Path,
        _token: &CancellationToken,
    ) -> Result<(), HarvestError> {
        let list = tokio::fs::read_to_string(concat_list).await?;
        tokio::fs::write(output, &list).await?;
        self.lists.lock().unwrap().push(list);
        Ok(())
    }
}

#[tokio::test]
async fn master_playlist_resolves_to_last_variant_with_origin_headers() {
    let server = MockServer::start().await;
    let origin = server.uri();

    Mock::given(method("GET"))
        .and(path("/show/master.m3u8"))
        .and(header("origin", origin.as_str()))
        .and(header("referer", format!("{origin}/").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n360p/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\n1080p/index.m3u8?sig=abc\n",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/show/1080p/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(vod_playlist(3)))
        .expect(1)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("{origin}/show/master.m3u8")).unwrap();
    let client = HttpClient::new(&config(root.path(), 4).downloader)
        .unwrap()
        .with_origin(&url);
    let source = Arc::new(HttpManifestSource::new(client, Duration::from_secs(5)));
    let resolver = PlaylistResolver::new(source, Arc::new(NullSink));

    let resolved = resolver
        .resolve(&url, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resolved.media_url().path(), "/show/1080p/index.m3u8");
    assert_eq!(resolved.media_url().query(), Some("sig=abc"));
    assert!(!resolved.is_live);
    assert!(resolved.has_end_marker);
}

#[tokio::test]
async fn manifest_http_error_is_a_fetch_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.m3u8"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let harvester = HlsHarvester::new(config(root.path(), 4), Arc::new(NullSink))
        .with_muxer(Arc::new(ListMuxer::default()));
    let outcome = harvester
        .run(
            &format!("{}/gone.m3u8", server.uri()),
            &root.path().join("out.ts"),
        )
        .await;

    assert!(matches!(
        outcome,
        AcquisitionOutcome::Failed {
            kind: FailureKind::FetchFailed,
            ..
        }
    ));
}

#[tokio::test]
async fn vod_job_skips_empty_segment_and_merges_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(vod_playlist(25)))
        .mount(&server)
        .await;
    for i in 0..25 {
        let body = if i == 11 { Vec::new() } else { ts_packet() };
        Mock::given(method("GET"))
            .and(path(format!("/vod/seg{i}.ts")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp2t")
                    .set_body_bytes(body)
                    // Later segments answer first.
                    .set_delay(Duration::from_millis(((25 - i) * 2) as u64)),
            )
            .mount(&server)
            .await;
    }

    let root = tempfile::tempdir().unwrap();
    let muxer = Arc::new(ListMuxer::default());
    let harvester =
        HlsHarvester::new(config(root.path(), 24), Arc::new(NullSink)).with_muxer(muxer.clone());
    let output = root.path().join("video.ts");

    let outcome = harvester
        .run(&format!("{}/vod/index.m3u8", server.uri()), &output)
        .await;

    let AcquisitionOutcome::Completed(report) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(report.segments_found, 25);
    assert_eq!(report.segments_downloaded, 24);
    assert_eq!(report.fetch_failures, 1);
    assert_eq!(report.segments_merged, 24);
    assert!(!report.degraded);

    let lists = muxer.lists.lock().unwrap();
    let names: Vec<String> = lists[0]
        .lines()
        .map(|line| line.rsplit('/').next().unwrap().trim_end_matches('\'').to_string())
        .collect();
    let mut expected: Vec<String> = (0..25)
        .filter(|i| *i != 11)
        .map(|i| format!("segment_{i:06}.ts"))
        .collect();
    expected.sort();
    assert_eq!(names, expected);

    // Only the output file is left under the root.
    let mut entries = tokio::fs::read_dir(root.path()).await.unwrap();
    let mut left = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        left.push(entry.file_name());
    }
    assert_eq!(left, vec![std::ffi::OsString::from("video.ts")]);
}

#[tokio::test]
async fn forbidden_segments_abort_as_drm_after_ten_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drm/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(vod_playlist(40)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(wiremock::matchers::path_regex(r"^/drm/seg\d+\.ts$"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let harvester = HlsHarvester::new(config(root.path(), 1), Arc::new(NullSink))
        .with_muxer(Arc::new(ListMuxer::default()));
    let outcome = harvester
        .run(
            &format!("{}/drm/index.m3u8", server.uri()),
            &root.path().join("out.ts"),
        )
        .await;

    assert!(matches!(
        outcome,
        AcquisitionOutcome::Failed {
            kind: FailureKind::ContentDrmProtected,
            ..
        }
    ));
    let requests = server.received_requests().await.unwrap();
    let segment_requests = requests
        .iter()
        .filter(|r| r.url.path().ends_with(".ts"))
        .count();
    assert_eq!(segment_requests, 10);
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.ts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_packet()))
        .with_priority(2)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let client = HttpClient::new(&config(root.path(), 1).downloader).unwrap();
    let url = Url::parse(&format!("{}/flaky.ts", server.uri())).unwrap();

    let response = client
        .get(&url, Duration::from_secs(5), "segment", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap().len(), 188);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

const ERROR_PAGE: &str = "<!DOCTYPE html><html><head><title>403 Forbidden</title></head></html>";

async fn mount_error_segments(server: &MockServer, prefix: &str, count: usize) {
    for i in 0..count {
        // Even segments are labelled HTML, odd ones hide the page behind a binary type.
        let content_type = if i % 2 == 0 {
            "text/html; charset=utf-8"
        } else {
            "application/octet-stream"
        };
        Mock::given(method("GET"))
            .and(path(format!("{prefix}/seg{i}.ts")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", content_type)
                    .set_body_string(ERROR_PAGE),
            )
            .mount(server)
            .await;
    }
}

async fn workspace_entries(workspace: &JobWorkspace) -> Vec<std::ffi::OsString> {
    let mut entries = tokio::fs::read_dir(workspace.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name());
    }
    names
}

#[tokio::test]
async fn html_segments_are_rejected_and_leave_no_file() {
    let server = MockServer::start().await;
    mount_error_segments(&server, "/html", 2).await;

    let root = tempfile::tempdir().unwrap();
    let workspace = JobWorkspace::create(Some(root.path())).unwrap();
    let client = HttpClient::new(&config(root.path(), 1).downloader).unwrap();
    let downloader =
        HttpSegmentDownloader::new(client, Duration::from_secs(5), SegmentClassifier::default());

    for index in 0..2 {
        let url = Url::parse(&format!("{}/html/seg{index}.ts", server.uri())).unwrap();
        let job = FetchJob {
            index,
            path: workspace.segment_path(index, &url),
            url,
        };

        let outcome = downloader.download(&job, &CancellationToken::new()).await;

        match outcome {
            SegmentOutcome::Failed { class, .. } => {
                assert_eq!(class, Some(SegmentClass::HtmlError), "segment {index}");
            }
            other => panic!("segment {index} should be rejected, got {other:?}"),
        }
        assert!(!job.path.exists(), "segment {index} left on disk");
        assert!(workspace_entries(&workspace).await.is_empty());
    }
}

#[tokio::test]
async fn html_answers_for_every_segment_abort_as_drm() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/paywall/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(vod_playlist(30)))
        .mount(&server)
        .await;
    mount_error_segments(&server, "/paywall", 30).await;

    let root = tempfile::tempdir().unwrap();
    let harvester = HlsHarvester::new(config(root.path(), 1), Arc::new(NullSink))
        .with_muxer(Arc::new(ListMuxer::default()));
    let outcome = harvester
        .run(
            &format!("{}/paywall/index.m3u8", server.uri()),
            &root.path().join("out.ts"),
        )
        .await;

    assert!(matches!(
        outcome,
        AcquisitionOutcome::Failed {
            kind: FailureKind::ContentDrmProtected,
            ..
        }
    ));
    let requests = server.received_requests().await.unwrap();
    let segment_requests = requests
        .iter()
        .filter(|r| r.url.path().ends_with(".ts"))
        .count();
    assert_eq!(segment_requests, 10);

    let mut entries = tokio::fs::read_dir(root.path()).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn http_proxy_also_carries_https_requests() {
    let proxy = MockServer::start().await;
    let config = HarvestConfig::builder()
        .retry(RetryPolicy::none())
        .proxy(ProxyConfig::from_url(proxy.uri()))
        .build();
    let client = HttpClient::new(&config.downloader).unwrap();
    let url = Url::parse("https://segments.example.invalid/seg0.ts").unwrap();

    let result = client
        .get(&url, Duration::from_secs(5), "segment", &CancellationToken::new())
        .await;

    // The mock cannot open a tunnel, but the request must have reached it.
    assert!(result.is_err());
    assert!(!proxy.received_requests().await.unwrap().is_empty());
}
