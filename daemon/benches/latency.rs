use criterion::{black_box, criterion_group, criterion_main, Criterion};
use xmoused::control::{pack_status, ControlMessage};
use xmoused::{ConfigByte, InputEventDescriptor, MemoryRegisters, PollEngine, PollState};

fn bench_poll(c: &mut Criterion) {
    let regs = MemoryRegisters::new();
    let mut engine = PollEngine::new(PollState::baseline(&regs, ConfigByte::default()));
    let mut sink: Vec<InputEventDescriptor> = Vec::with_capacity(1024);

    let mut group = c.benchmark_group("Poll tick");

    group.bench_function("Idle tick", |b| {
        b.iter(|| {
            let report = engine.on_tick(&regs, &mut sink).unwrap();
            black_box(report);
        });
    });

    // One notch and one button edge per tick
    let mut counter: i8 = 0;
    group.bench_function("Wheel notch + button edge", |b| {
        b.iter(|| {
            counter = counter.wrapping_add(1);
            regs.set_wheel(counter);
            regs.set_buttons((counter as u16) & 0b01);
            let report = engine.on_tick(&regs, &mut sink).unwrap();
            sink.clear();
            black_box(report);
        });
    });

    group.finish();
}

fn bench_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("Control protocol");

    group.bench_function("Request from bus fields", |b| {
        b.iter(|| black_box(ControlMessage::from_raw(black_box(2), black_box(20_000))));
    });

    group.bench_function("Pack status", |b| {
        b.iter(|| black_box(pack_status(black_box(ConfigByte::default()), black_box(10_000))));
    });

    group.finish();
}

criterion_group!(benches, bench_poll, bench_control);
criterion_main!(benches);
