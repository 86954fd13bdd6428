use criterion::{black_box, criterion_group, criterion_main, Criterion};
use easel_collab::broadcast::{ConnectionLink, Outbound};
use easel_collab::protocol::{Message, MessageKind, Operation, RasterChunk};
use easel_collab::session::{Greeting, Session, SessionOptions};
use easel_collab::sync::{Canvas, JoinSync, ReplayCanvas, SnapshotUpload, SyncBuffer, SyncBufferLimits};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn operation(payload_len: usize) -> Message {
    Message::Operation(Operation {
        session_id: Uuid::new_v4(),
        user_id: 7,
        payload: vec![0u8; payload_len],
    })
}

fn bench_operation_encode(c: &mut Criterion) {
    let msg = operation(64);
    c.bench_function("operation_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let encoded = operation(64).encode().unwrap();
    c.bench_function("operation_decode_64B", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_raster_decode(c: &mut Criterion) {
    let encoded = Message::Raster(RasterChunk {
        session_id: Uuid::new_v4(),
        offset: 0,
        length: 4096,
        size: 65536,
        data: vec![0xab; 4096],
    })
    .encode()
    .unwrap();
    c.bench_function("raster_decode_4KiB", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

/// 100 live members, one operation fanned out to all of them.
fn bench_broadcast_fanout(c: &mut Criterion) {
    let mut session = Session::new(
        Uuid::new_v4(),
        SessionOptions {
            max_members: 128,
            ..SessionOptions::default()
        },
    );
    let mut queues = Vec::new();
    let greeting = Greeting::default();
    let session_id = session.id();
    for i in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        let link = ConnectionLink::new(&tx);
        let ticket = session
            .join(&format!("user{i}"), "127.0.0.1", link, &greeting)
            .unwrap();
        // Walk every joiner through an empty snapshot transfer so all are live.
        if let Some(provider) = ticket.provider {
            let joiner = ticket.user_id;
            session
                .submit(provider, Message::ack(session_id, MessageKind::Synchronize))
                .unwrap();
            session
                .submit(joiner, Message::ack(session_id, MessageKind::SyncWait))
                .unwrap();
            session
                .submit(provider, Message::Raster(RasterChunk::empty(session_id)))
                .unwrap();
            session
                .submit(joiner, Message::ack(session_id, MessageKind::Raster))
                .unwrap();
        }
        queues.push((tx, rx));
    }
    let msg = operation(64);

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            black_box(session.broadcast(&msg, None).ok());
            for (_, rx) in queues.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_sync_buffer(c: &mut Criterion) {
    let frame = Arc::new(vec![0u8; 64]);
    c.bench_function("sync_buffer_push_drain_1K", |b| {
        b.iter(|| {
            let mut buffer = SyncBuffer::new(SyncBufferLimits::default());
            for _ in 0..1000 {
                buffer.push(frame.clone()).unwrap();
            }
            black_box(buffer.drain().count());
        })
    });
}

fn bench_snapshot_transfer(c: &mut Criterion) {
    let mut source = ReplayCanvas::new();
    for i in 0..2000u32 {
        source.apply(1, &i.to_be_bytes());
    }
    let snapshot = source.snapshot();
    let session_id = Uuid::new_v4();

    c.bench_function("snapshot_transfer_2K_ops", |b| {
        b.iter(|| {
            let mut upload = SnapshotUpload::new(session_id, snapshot.clone());
            let mut join = JoinSync::default();
            let mut canvas = ReplayCanvas::new();
            while let Some(chunk) = upload.next_chunk() {
                black_box(join.on_raster(&chunk, &mut canvas).unwrap());
            }
            black_box(canvas.ops().len());
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_raster_decode,
    bench_broadcast_fanout,
    bench_sync_buffer,
    bench_snapshot_transfer,
);
criterion_main!(benches);
