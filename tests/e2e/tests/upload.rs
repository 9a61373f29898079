use std::sync::Arc;

use chunkferry_client::{ChunkTransport, ClientError, Scheduler, SchedulerConfig, UploadEvent};
use chunkferry_e2e::{TestServer, wait_for_terminal};
use chunkferry_protocol::SessionStatus;
use chunkferry_transfer::{ChunkReader, calculate_file_checksum, checksum_bytes};

const CHUNK: u64 = 4096;

fn scheduler(transport: Arc<dyn ChunkTransport>) -> Scheduler {
    Scheduler::new(transport, SchedulerConfig::default())
}

#[tokio::test]
async fn upload_completes_with_matching_hash() {
    let server = TestServer::start(CHUNK).await;
    let path = server.write_source("photos.zip", 10 * 1024 + 17);
    let transport = server.connect().await;

    let mut sched = scheduler(transport.clone());
    let mut events = sched.take_events().unwrap();
    let session = sched.start(&path).await.unwrap();
    assert_eq!(session.total_chunks, 3);
    assert_eq!(session.chunk_size, CHUNK);
    sched.wait_idle().await;
    assert!(sched.snapshot().completed);

    let status = wait_for_terminal(transport.as_ref(), &path).await;
    assert_eq!(status.status, Some(SessionStatus::Completed));
    assert_eq!(status.session_id.as_deref(), Some(session.session_id.as_str()));
    assert_eq!(
        status.final_hash.unwrap(),
        calculate_file_checksum(&path).unwrap()
    );

    let stored = std::fs::read(server.service.storage().path_for(&session.session_id)).unwrap();
    assert_eq!(stored, std::fs::read(&path).unwrap());

    let mut completions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, UploadEvent::Completed { .. }) {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
    server.stop().await;
}

#[tokio::test]
async fn interrupted_upload_resumes_where_it_stopped() {
    let server = TestServer::start(CHUNK).await;
    let path = server.write_source("backup.tar", 5 * CHUNK as usize);
    let transport = server.connect().await;

    // First attempt gets two chunks across before the client goes away.
    let size = std::fs::metadata(&path).unwrap().len();
    let first = transport.establish("backup.tar", size).await.unwrap();
    let reader = ChunkReader::new(&path, first.chunk_size).unwrap();
    for index in [0, 3] {
        let data = reader.read_chunk(index).unwrap();
        let sum = checksum_bytes(&data);
        transport
            .send_chunk(&first.session_id, index, data, Some(sum))
            .await
            .unwrap();
    }

    let status = transport.status("backup.tar", size).await.unwrap();
    assert!(status.exists);
    assert_eq!(status.completed_indices, Some(vec![0, 3]));
    assert_eq!(status.status, Some(SessionStatus::Uploading));

    let fresh = server.connect().await;
    let mut sched = scheduler(fresh.clone());
    let mut events = sched.take_events().unwrap();
    let resumed = sched.start(&path).await.unwrap();
    assert_eq!(resumed.session_id, first.session_id);
    assert_eq!(resumed.completed_indices, vec![0, 3]);
    sched.wait_idle().await;

    match events.try_recv().unwrap() {
        UploadEvent::Started {
            already_uploaded, ..
        } => assert_eq!(already_uploaded, 2),
        other => panic!("expected Started, got {other:?}"),
    }

    let status = wait_for_terminal(fresh.as_ref(), &path).await;
    assert_eq!(status.status, Some(SessionStatus::Completed));
    assert_eq!(status.final_hash.unwrap(), calculate_file_checksum(&path).unwrap());
    assert_eq!(server.service.stats().chunks_written, 5);
    server.stop().await;
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let server = TestServer::start(CHUNK).await;
    let transport = server.connect().await;

    let err = transport
        .send_chunk("no-such-session", 0, vec![1, 2, 3], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { code: 404, .. }));

    let session = transport.establish("data.bin", CHUNK + 10).await.unwrap();
    let err = transport
        .send_chunk(&session.session_id, 1, vec![0u8; 9], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { code: 400, .. }));
    assert!(!err.is_retryable());

    let err = transport
        .send_chunk(&session.session_id, 2, vec![0u8; 10], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { code: 400, .. }));

    let err = transport
        .send_chunk(&session.session_id, 1, vec![0u8; 10], Some("0".repeat(64)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { code: 400, .. }));

    let err = transport.establish("../escape", 10).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { code: 400, .. }));

    let status = transport.status("data.bin", CHUNK + 10).await.unwrap();
    assert_eq!(status.completed_indices, Some(Vec::new()));
    server.stop().await;
}

#[tokio::test]
async fn duplicate_chunk_is_acknowledged_once() {
    let server = TestServer::start(CHUNK).await;
    let transport = server.connect().await;
    let session = transport.establish("twice.bin", 2 * CHUNK).await.unwrap();

    let data = vec![9u8; CHUNK as usize];
    let first = transport
        .send_chunk(&session.session_id, 0, data.clone(), None)
        .await
        .unwrap();
    assert!(!first.already_received);

    let again = transport
        .send_chunk(&session.session_id, 0, vec![1u8; 3], None)
        .await
        .unwrap();
    assert!(again.already_received);
    assert_eq!(server.service.stats().chunks_written, 1);
    assert_eq!(server.service.stats().duplicate_chunks, 1);
    server.stop().await;
}

#[tokio::test]
async fn unknown_file_has_no_session() {
    let server = TestServer::start(CHUNK).await;
    let transport = server.connect().await;

    let status = transport.status("never-seen.bin", 42).await.unwrap();
    assert!(!status.exists);
    assert!(status.session_id.is_none());
    server.stop().await;
}

#[tokio::test]
async fn two_clients_share_one_session_and_finalize_once() {
    let server = TestServer::start(CHUNK).await;
    let path = server.write_source("shared.iso", 8 * CHUNK as usize + 1);

    let a = scheduler(server.connect().await);
    let b = scheduler(server.connect().await);
    let (sa, sb) = tokio::join!(a.start(&path), b.start(&path));
    let (sa, sb) = (sa.unwrap(), sb.unwrap());
    assert_eq!(sa.session_id, sb.session_id);

    tokio::join!(a.wait_idle(), b.wait_idle());
    assert!(a.snapshot().completed);
    assert!(b.snapshot().completed);

    let transport = server.connect().await;
    let status = wait_for_terminal(transport.as_ref(), &path).await;
    assert_eq!(status.status, Some(SessionStatus::Completed));
    assert_eq!(status.final_hash.unwrap(), calculate_file_checksum(&path).unwrap());

    server.service.drain().await;
    let stats = server.service.stats();
    assert_eq!(stats.sessions_completed, 1);
    assert_eq!(stats.chunks_written, 9);
    server.stop().await;
}

#[tokio::test]
async fn completed_file_is_not_uploaded_again() {
    let server = TestServer::start(CHUNK).await;
    let path = server.write_source("done.bin", 3 * CHUNK as usize);
    let transport = server.connect().await;

    let first = scheduler(transport.clone());
    first.start(&path).await.unwrap();
    first.wait_idle().await;
    wait_for_terminal(transport.as_ref(), &path).await;
    let written = server.service.stats().chunks_written;

    let second = scheduler(transport.clone());
    let session = second.start(&path).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    second.wait_idle().await;
    assert!(second.snapshot().completed);
    assert_eq!(server.service.stats().chunks_written, written);
    server.stop().await;
}
