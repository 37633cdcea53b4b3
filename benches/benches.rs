use criterion::{black_box, criterion_group, criterion_main, Criterion};

use reprise::{Cursor, TimeBase};

fn cursor_snapping(c: &mut Criterion) {
    let op = TimeBase::Tempo;
    let grid = Cursor::from_beats(0.25, 120.0).unwrap();
    let cursor = Cursor::from_beats(13.37, 120.0).unwrap();

    c.bench_function("snap tempo", |b| {
        b.iter(|| op.snap(black_box(cursor), black_box(grid), 120.0))
    });
    c.bench_function("snap absolute", |b| {
        let op = TimeBase::Absolute;
        b.iter(|| op.snap(black_box(cursor), black_box(grid), 120.0))
    });
}

fn cursor_arithmetic(c: &mut Criterion) {
    let a = Cursor::from_millis(1234.5, 120.0).unwrap();
    let b_cursor = Cursor::from_millis(678.9, 120.0).unwrap();

    c.bench_function("cursor add", |b| {
        b.iter(|| black_box(a).add(black_box(b_cursor)))
    });
    c.bench_function("cursor lerp", |b| {
        b.iter(|| Cursor::lerp(black_box(a), black_box(b_cursor), black_box(0.37)))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = cursor_snapping, cursor_arithmetic
}
criterion_main!(benches);
