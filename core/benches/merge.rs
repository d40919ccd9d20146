use charla_core::{
    merge::merge_records,
    record::{DeliveryStatus, Message, SenderKind},
};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("merge_records_disjoint_500x100", |b| {
        let current = sample_records(0, 500);
        let incoming = sample_records(500, 100);
        b.iter(|| {
            let merged = merge_records(black_box(&current), black_box(&incoming));
            black_box(merged);
        });
    });

    c.bench_function("merge_records_overlapping_500x500", |b| {
        let current = sample_records(0, 500);
        let incoming: Vec<Message> = current
            .iter()
            .map(|record| {
                let mut refreshed = record.clone();
                refreshed.content = format!("{} (edited)", record.content);
                refreshed
            })
            .collect();
        b.iter(|| {
            let merged = merge_records(black_box(&current), black_box(&incoming));
            black_box(merged);
        });
    });
}

fn sample_records(offset: usize, count: usize) -> Vec<Message> {
    let base = Utc
        .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    (0..count)
        .map(|idx| {
            let n = offset + idx;
            Message {
                id: format!("m{n:05}").into(),
                collection_id: "bench".into(),
                content: format!("record {n}"),
                created_at: base + ChronoDuration::milliseconds(n as i64),
                sender_kind: SenderKind::User,
                status: DeliveryStatus::Confirmed,
            }
        })
        .collect()
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
