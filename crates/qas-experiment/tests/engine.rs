//! Run engine against the simulated beamline.

use qas_core::capabilities::{Acquirable, TrajectoryMotor};
use qas_core::config::Settings;
use qas_core::context::{BeamlineContext, MetadataStore};
use qas_core::document::Document;
use qas_driver_sim::{FlyerVariant, SimBeamline, SimOptions};
use qas_experiment::{scan_metadata, EngineState, FlyScan, RunEngine, ScanInfo};
use qas_flyer::{Flyer, FlyerState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Bench {
    engine: Arc<RunEngine>,
    flyer: Arc<Flyer>,
    sim: SimBeamline,
    _dir: TempDir,
}

fn settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.paths.root = dir.join("legacy");
    settings.paths.pizzabox_dir = dir.join("pb");
    settings.paths.mount_root = dir.join("mnt");
    settings.trigger.stream_settle = Duration::from_millis(5);
    settings.streaming.mount_check_wait = Duration::from_millis(300);
    settings
}

async fn bench(variant: FlyerVariant) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let context = BeamlineContext::new(settings(dir.path()));
    context.metadata().set("cycle", json!("2024-2")).unwrap();
    context.metadata().set("PROPOSAL", json!(312345)).unwrap();
    let sim =
        SimBeamline::build(context.settings(), SimOptions::default(), context.cancel_token())
            .unwrap();
    let flyer = Arc::new(sim.flyer(variant).unwrap());

    let engine = Arc::new(RunEngine::new(context));
    let motor: Arc<dyn TrajectoryMotor> = sim.devices.mono.clone();
    engine.register_motor(motor).await;
    let acquirable: Arc<dyn Acquirable> = flyer.clone();
    engine.register_flyer(acquirable).await;
    Bench {
        engine,
        flyer,
        sim,
        _dir: dir,
    }
}

fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn kinds(docs: &[Document]) -> Vec<&'static str> {
    docs.iter().map(Document::kind).collect()
}

#[tokio::test]
async fn fly_scan_emits_a_complete_run() {
    let bench = bench(FlyerVariant::Apb).await;
    let mut rx = bench.engine.subscribe();

    let stops = bench
        .engine
        .run(Box::new(FlyScan::new("Cu foil", "flyer_apb", "mono1")))
        .await
        .unwrap();

    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exit_status, "success");
    let docs = drain(&mut rx);
    let kinds = kinds(&docs);
    assert_eq!(kinds.first(), Some(&"start"));
    assert_eq!(kinds.last(), Some(&"stop"));

    let last_asset = kinds
        .iter()
        .rposition(|k| *k == "resource" || *k == "datum")
        .unwrap();
    let first_event = kinds.iter().position(|k| *k == "event").unwrap();
    let last_descriptor = kinds.iter().rposition(|k| *k == "descriptor").unwrap();
    assert!(last_descriptor < first_event);
    assert!(last_asset < first_event, "assets precede the events using them");

    let events = kinds.iter().filter(|k| **k == "event").count() as u32;
    assert_eq!(stops[0].num_events, events);

    let run_uid = match &docs[0] {
        Document::Start(start) => {
            assert_eq!(start.plan_type, "fly_scan");
            assert_eq!(start.metadata["name"], json!("Cu foil 0001"));
            start.uid.clone()
        }
        other => panic!("expected start, got {}", other.kind()),
    };
    for doc in &docs {
        match doc {
            Document::Resource(r) => assert_eq!(r.run_start.as_deref(), Some(run_uid.as_str())),
            Document::Event(e) => {
                assert_eq!(e.run_uid, run_uid);
                assert_eq!(e.seq_num, 1, "one event per stream");
            }
            _ => {}
        }
    }
    assert_eq!(bench.flyer.state().await, FlyerState::Idle);
    assert_eq!(bench.engine.state().await, EngineState::Idle);
}

#[tokio::test]
async fn repeated_cycles_open_one_run_each() {
    let bench = bench(FlyerVariant::ApbTrigger).await;
    let mut rx = bench.engine.subscribe();

    let stops = bench
        .engine
        .run(Box::new(
            FlyScan::new("scan", "flyer_apb_trigger", "mono1")
                .with_cycles(2)
                .with_delay(0.01),
        ))
        .await
        .unwrap();

    assert_eq!(stops.len(), 2);
    assert!(stops.iter().all(|s| s.exit_status == "success"));
    let names: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|doc| match doc {
            Document::Start(start) => Some(start.metadata["name"].clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec![json!("scan 0001"), json!("scan 0002")]);

    let prepares = bench
        .sim
        .log
        .puts_to("XF:07BMA-OP{Mono:1-Ax:Bragg}PrepareTraj")
        .into_iter()
        .filter(|v| v.as_rounded() == Some(1))
        .count();
    assert_eq!(prepares, 2);
}

#[tokio::test]
async fn start_document_carries_scan_metadata() {
    let bench = bench(FlyerVariant::Xs).await;
    let mut rx = bench.engine.subscribe();
    let context = BeamlineContext::new(Settings::default());
    context.metadata().set("cycle", json!("2024-2")).unwrap();
    let info = ScanInfo::xs("Fe foil", "reference");
    let md = scan_metadata(context.metadata().as_ref(), &info);

    bench
        .engine
        .run(Box::new(
            FlyScan::new(&info.name, "flyer_xs", "mono1")
                .with_plan_name(&info.plan_name)
                .with_metadata(md),
        ))
        .await
        .unwrap();

    let start = drain(&mut rx)
        .into_iter()
        .find_map(|doc| match doc {
            Document::Start(start) => Some(start),
            _ => None,
        })
        .unwrap();
    assert_eq!(start.plan_name, "execute_trajectory_xs");
    assert_eq!(start.metadata["aux_detector"], json!("XSpress3"));
    assert_eq!(start.metadata["comment"], json!("reference"));
    let interp = start.metadata["interp_filename"].as_str().unwrap();
    assert!(interp.ends_with("2024-2/Fe foil 0001.raw"), "{interp}");
}

#[tokio::test]
async fn abort_closes_the_open_run_and_releases_the_flyer() {
    let bench = bench(FlyerVariant::Apb).await;
    let mut rx = bench.engine.subscribe();

    let engine = bench.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .run(Box::new(FlyScan::new("scan", "flyer_apb", "mono1")))
            .await
    });

    loop {
        if let Document::Start(_) = rx.recv().await.unwrap() {
            break;
        }
    }
    bench.engine.abort("operator request").await.unwrap();

    let stops = run.await.unwrap().unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exit_status, "abort");
    assert_eq!(stops[0].reason, "operator request");
    assert_eq!(bench.flyer.state().await, FlyerState::Idle);
    assert_eq!(bench.sim.regs.apb.stream.value().as_rounded(), Some(0));
    assert_eq!(bench.engine.state().await, EngineState::Idle);

    let stops = bench
        .engine
        .run(Box::new(FlyScan::new("again", "flyer_apb", "mono1")))
        .await
        .unwrap();
    assert_eq!(stops[0].exit_status, "success");
}

#[tokio::test]
async fn unknown_flyer_fails_the_open_run() {
    let bench = bench(FlyerVariant::Apb).await;

    let stops = bench
        .engine
        .run(Box::new(FlyScan::new("scan", "flyer_missing", "mono1")))
        .await
        .unwrap();

    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exit_status, "fail");
    assert!(stops[0].reason.contains("flyer_missing"), "{}", stops[0].reason);
    assert_eq!(stops[0].num_events, 0);
}

#[tokio::test]
async fn queued_plans_run_in_order() {
    let bench = bench(FlyerVariant::Apb).await;
    let mut rx = bench.engine.subscribe();
    bench
        .engine
        .queue(Box::new(FlyScan::new("first", "flyer_apb", "mono1")))
        .await;
    bench
        .engine
        .queue(Box::new(FlyScan::new("second", "flyer_apb", "mono1")))
        .await;

    bench.engine.start().await.unwrap();
    bench.engine.start().await.unwrap();
    assert!(bench.engine.start().await.is_err());

    let names: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|doc| match doc {
            Document::Start(start) => Some(start.metadata["name"].clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec![json!("first 0001"), json!("second 0001")]);
}
