use chrono::{DateTime, TimeDelta, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use therapy_telemetry::codec::{decode, encode, DeviceStatus, MessageKind, Notification};
use therapy_telemetry::report::Report;
use therapy_telemetry::session::{Session, SessionStatus};

const READING: &str =
    r#"{"deviceId":"neg-pressure-device-1","value":-72.5,"mode":"continuous","status":"running","error":false}"#;
const FAULT: &str = r#"{"deviceId":"neg-pressure-device-1","value":0,"error":true,"severity":"warning","message":"Canister nearly full"}"#;

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_546_800, 0).expect("valid timestamp")
}

/// A finished session with one reading per second and a pause every minute.
fn build_session(readings: i64) -> Session {
    let mut session = Session::new("neg-pressure-device-1");
    let start = base();
    session.apply_status(Some(DeviceStatus::Running), start);

    for i in 0..readings {
        let now = start + TimeDelta::seconds(i);
        if i % 60 == 30 {
            session.apply_status(Some(DeviceStatus::Paused), now);
        } else if i % 60 == 35 {
            session.apply_status(Some(DeviceStatus::Running), now);
        }
        session.record_reading(-70.0 - (i % 10) as f64, now, None);
    }

    session.apply_status(
        Some(DeviceStatus::Ended),
        start + TimeDelta::seconds(readings),
    );
    session
}

fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode/reading", |b| {
        b.iter(|| decode(black_box(READING)).expect("decode reading"))
    });

    c.bench_function("decode/fault", |b| {
        b.iter(|| decode(black_box(FAULT)).expect("decode fault"))
    });
}

fn bench_apply(c: &mut Criterion) {
    let msg = decode(READING).expect("decode reading");

    c.bench_function("session/apply_and_notify", |b| {
        let mut session = Session::new("neg-pressure-device-1");
        let now = base();
        b.iter(|| {
            session.set_mode(msg.mode);
            session.apply_status(msg.status, now);
            if let MessageKind::Reading { value } = &msg.kind {
                session.record_reading(*value, now, None);
            }
            if session.observations().len() >= 10_000 {
                session.reset();
            }
            let n = Notification::for_message(&msg, session.mode(), session.status(), now);
            black_box(encode(&n).expect("encode notification"))
        });
    });
}

fn bench_report(c: &mut Criterion) {
    let mut session = build_session(3_600);
    assert_eq!(session.status(), SessionStatus::Ended);
    let snapshot = session.finish();

    c.bench_function("report/one_hour_session", |b| {
        b.iter(|| {
            let report = Report::from_snapshot(black_box(&snapshot)).expect("report");
            black_box(report.conclusion())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_apply(c);
    bench_report(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
