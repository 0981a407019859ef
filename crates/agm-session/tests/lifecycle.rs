//! End-to-end session lifecycle scenarios against the mock engine and
//! mock PCM driver.

use std::sync::Arc;

use agm_core::{
    tags, BufferConfig, Direction, EventParams, KeyValue, KeyVector, Metadata, MediaConfig,
    StreamConfig, EVENT_ID_EOS_RENDERED, EVENT_ID_WRITE_DONE, ENGINE_EVENT_SOURCE_MODULE,
};
use agm_core::{AgmError, EventType};
use agm_device::mock::{MockPcm, PcmPhase};
use agm_device::DeviceState;
use agm_engine::mock::{MockCommand, MockEngine};
use agm_session::{AifState, AudioGraphManager, ServiceConfig, SessionState};
use parking_lot::Mutex;

const REGISTRY: &str = "\
00-00: Speaker : : playback 1
00-01: Headphones : : playback 1
00-02: Line Out : : playback 1
00-03: HDMI Out : : playback 1
00-04: Builtin Mic : : capture 1
";

/// GKV key marking a capture stream; the mock engine reports the
/// capture tag set for key vectors carrying it.
const CAPTURE_KEY: u32 = 0xCA0;

fn rx_tags() -> Vec<u32> {
    vec![
        tags::STREAM_INPUT_MEDIA_FORMAT,
        tags::STREAM_PCM_DECODER,
        tags::STREAM_SHMEM_ENDPOINT,
        tags::STREAM_SPR,
        tags::STREAM_PAUSE,
        tags::DEVICE_HW_ENDPOINT_RX,
    ]
}

fn tx_tags() -> Vec<u32> {
    vec![
        tags::STREAM_INPUT_MEDIA_FORMAT,
        tags::STREAM_PCM_ENCODER,
        tags::STREAM_SHMEM_ENDPOINT,
        tags::DEVICE_HW_ENDPOINT_TX,
    ]
}

struct Fixture {
    manager: AudioGraphManager,
    engine: MockEngine,
    pcm: MockPcm,
    _dir: tempfile::TempDir,
}

fn fixture_with(engine: MockEngine) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("pcm");
    std::fs::write(&registry, REGISTRY).unwrap();
    let acdb_dir = dir.path().join("acdb");
    std::fs::create_dir(&acdb_dir).unwrap();
    std::fs::write(acdb_dir.join("platform.acdb"), b"cal").unwrap();

    let config = ServiceConfig {
        pcm_registry: registry,
        acdb_dir,
        ..ServiceConfig::default()
    };
    let pcm = MockPcm::new();
    let manager = AudioGraphManager::new(
        &config,
        Arc::new(engine.clone()),
        Arc::new(pcm.clone()),
    )
    .unwrap();
    assert!(engine.initialized());

    Fixture {
        manager,
        engine,
        pcm,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        MockEngine::new()
            .with_tags(&rx_tags())
            .with_tags_for_key(CAPTURE_KEY, &tx_tags()),
    )
}

fn gkv_bytes(pairs: &[(u32, u32)]) -> Vec<u8> {
    Metadata {
        gkv: KeyVector::from_pairs(pairs.iter().copied()),
        ..Metadata::default()
    }
    .to_bytes()
}

fn rx_config() -> StreamConfig {
    StreamConfig {
        direction: Direction::Rx,
        ..StreamConfig::default()
    }
}

fn tx_config() -> StreamConfig {
    StreamConfig {
        direction: Direction::Tx,
        ..StreamConfig::default()
    }
}

fn session_state(f: &Fixture, id: u32) -> SessionState {
    f.manager.sessions().retrieve(id).unwrap().state()
}

fn aif_state(f: &Fixture, sess: u32, aif: u32) -> AifState {
    f.manager
        .sessions()
        .retrieve(sess)
        .unwrap()
        .aif_state(aif)
        .unwrap()
}

#[test]
fn playback_open_start_write_close() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_config(
        10,
        &rx_config(),
        &MediaConfig::default(),
        &BufferConfig {
            count: 4,
            size: 3840,
        },
    );
    m.session_set_metadata(10, &gkv_bytes(&[(1, 100), (2, 200)]))
        .unwrap();
    m.session_aif_connect(10, 3, true).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Closed);
    assert_eq!(aif_state(&f, 10, 3), AifState::Open);

    m.session_open(10).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Opened);
    let device = m.devices().get(3).unwrap();
    assert_eq!(device.open_refcount(), 1);

    m.session_prepare(10).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Prepared);

    m.session_start(10).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Started);
    assert_eq!(device.state(), DeviceState::Started);
    assert_eq!(aif_state(&f, 10, 3), AifState::Started);

    assert_eq!(m.session_write(10, &[0u8; 7680]).unwrap(), 7680);
    assert_eq!(m.session_write(10, &[0u8; 7680]).unwrap(), 7680);

    m.session_stop(10).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Stopped);
    assert_eq!(device.state(), DeviceState::Stopped);
    assert_eq!(device.start_refcount(), 0);

    m.session_close(10).unwrap();
    assert_eq!(session_state(&f, 10), SessionState::Closed);
    assert_eq!(device.open_refcount(), 0);
    assert_eq!(f.pcm.open_streams(3), 0);

    // The engine saw the full command sequence in order.
    let commands = f.engine.commands();
    let position = |needle: fn(&MockCommand) -> bool| commands.iter().position(needle).unwrap();
    let open = position(|c| matches!(c, MockCommand::Open { .. }));
    let prepare = position(|c| matches!(c, MockCommand::Prepare));
    let start = position(|c| matches!(c, MockCommand::Start));
    let stop = position(|c| matches!(c, MockCommand::Stop { .. }));
    let close = position(|c| matches!(c, MockCommand::Close));
    assert!(open < prepare && prepare < start && start < stop && stop < close);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, MockCommand::Write { len: 7680 }))
            .count(),
        2
    );
}

#[test]
fn late_device_attach_while_started() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_config(5, &rx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(5, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_set_metadata(5, 1, &gkv_bytes(&[(10, 1)]))
        .unwrap();
    m.session_aif_connect(5, 1, true).unwrap();
    m.session_open(5).unwrap();
    m.session_prepare(5).unwrap();
    m.session_start(5).unwrap();

    m.session_aif_set_metadata(5, 2, &gkv_bytes(&[(10, 2)]))
        .unwrap();
    f.engine.clear_commands();
    m.session_aif_connect(5, 2, true).unwrap();

    assert_eq!(session_state(&f, 5), SessionState::Started);
    assert_eq!(aif_state(&f, 5, 2), AifState::Started);
    let late = m.devices().get(2).unwrap();
    assert_eq!(late.state(), DeviceState::Started);
    assert_eq!(f.pcm.phases(2), vec![
        PcmPhase::Open,
        PcmPhase::Prepare,
        PcmPhase::Start
    ]);
    assert!(f
        .engine
        .commands()
        .iter()
        .any(|c| matches!(c, MockCommand::AddGraph { .. })));
}

#[test]
fn failed_device_start_rolls_back() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_config(7, &rx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(7, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_set_metadata(7, 1, &gkv_bytes(&[(10, 1)]))
        .unwrap();
    m.session_aif_set_metadata(7, 2, &gkv_bytes(&[(10, 2)]))
        .unwrap();
    m.session_aif_connect(7, 1, true).unwrap();
    m.session_aif_connect(7, 2, true).unwrap();
    m.session_open(7).unwrap();
    m.session_prepare(7).unwrap();

    f.pcm.fail_on(2, PcmPhase::Start);
    assert!(m.session_start(7).is_err());

    assert_eq!(session_state(&f, 7), SessionState::Prepared);
    assert_eq!(aif_state(&f, 7, 1), AifState::Opened);
    assert_eq!(aif_state(&f, 7, 2), AifState::Opened);

    // Device 1 came up and was torn back down.
    let phases = f.pcm.phases(1);
    let start = phases.iter().position(|p| *p == PcmPhase::Start).unwrap();
    let stop = phases.iter().position(|p| *p == PcmPhase::Stop).unwrap();
    assert!(start < stop);
    assert_eq!(m.devices().get(1).unwrap().start_refcount(), 0);

    // A retry succeeds once the device recovers.
    f.pcm.clear_failures();
    m.session_prepare(7).unwrap();
    m.session_start(7).unwrap();
    assert_eq!(session_state(&f, 7), SessionState::Started);
}

#[test]
fn loopback_realized_on_open() {
    let f = fixture();
    let m = &f.manager;

    // Playback side.
    m.session_set_config(30, &rx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(30, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(30, 0, true).unwrap();
    m.session_open(30).unwrap();
    m.session_prepare(30).unwrap();
    m.session_start(30).unwrap();

    // Capture side stages the loopback before opening.
    m.session_set_config(20, &tx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(20, &gkv_bytes(&[(CAPTURE_KEY, 1)]))
        .unwrap();
    m.session_set_loopback(20, 30, true).unwrap();
    m.session_aif_connect(20, 4, true).unwrap();

    f.engine.clear_commands();
    m.session_open(20).unwrap();
    assert_eq!(session_state(&f, 20), SessionState::Opened);

    // The loopback edge carried the merged metadata of both sessions.
    assert!(f.engine.commands().iter().any(|c| matches!(
        c,
        MockCommand::AddGraph { gkv }
            if gkv.contains_key(CAPTURE_KEY) && gkv.contains_key(1)
    )));

    // Still enabled: a duplicate request is redundant.
    assert!(matches!(
        m.session_set_loopback(20, 30, true),
        Err(AgmError::Already(_))
    ));

    // With the playback session running, capture may start.
    m.session_prepare(20).unwrap();
    m.session_start(20).unwrap();
    assert_eq!(session_state(&f, 20), SessionState::Started);
}

#[test]
fn capture_start_requires_started_loopback_peer() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_config(21, &tx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(21, &gkv_bytes(&[(CAPTURE_KEY, 2)]))
        .unwrap();
    m.session_set_loopback(21, 31, true).unwrap();
    m.session_aif_connect(21, 4, true).unwrap();
    m.session_open(21).unwrap();
    m.session_prepare(21).unwrap();

    // Peer 31 was never opened, let alone started.
    assert!(matches!(
        m.session_start(21),
        Err(AgmError::InvalidState(_))
    ));
    assert_eq!(session_state(&f, 21), SessionState::Prepared);
}

#[test]
fn pause_resume_without_pause_module() {
    let f = fixture_with(MockEngine::new().with_tags(&[
        tags::STREAM_INPUT_MEDIA_FORMAT,
        tags::STREAM_PCM_DECODER,
        tags::STREAM_SHMEM_ENDPOINT,
        tags::DEVICE_HW_ENDPOINT_RX,
    ]));
    let m = &f.manager;

    m.session_set_config(11, &rx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(11, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(11, 0, true).unwrap();
    m.session_open(11).unwrap();
    m.session_prepare(11).unwrap();
    m.session_start(11).unwrap();

    f.engine.clear_commands();
    m.session_pause(11).unwrap();
    assert_eq!(session_state(&f, 11), SessionState::Paused);
    m.session_resume(11).unwrap();
    assert_eq!(session_state(&f, 11), SessionState::Started);

    // No custom config went to the engine for either transition.
    assert!(f
        .engine
        .commands()
        .iter()
        .all(|c| !matches!(c, MockCommand::SetConfig { .. })));
}

#[test]
fn event_fanout_filters_by_subscription() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_config(42, &rx_config(), &MediaConfig::default(), &BufferConfig {
        count: 2,
        size: 1920,
    });
    m.session_set_metadata(42, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(42, 0, true).unwrap();
    m.session_open(42).unwrap();

    let data_hits = Arc::new(Mutex::new(Vec::new()));
    let module_hits = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&data_hits);
    m.session_register_cb(
        42,
        Some(Arc::new(move |sess, params: &EventParams| {
            sink.lock().push((sess, params.event_id));
        })),
        EventType::DataPath,
        1,
    );
    let sink = Arc::clone(&module_hits);
    m.session_register_cb(
        42,
        Some(Arc::new(move |sess, params: &EventParams| {
            sink.lock().push((sess, params.event_id));
        })),
        EventType::Module,
        2,
    );

    let inject = |source, id| {
        f.engine.inject_event(&EventParams {
            source_module_id: source,
            event_id: id,
            payload: Vec::new(),
        });
    };
    inject(ENGINE_EVENT_SOURCE_MODULE, EVENT_ID_WRITE_DONE);
    inject(0x5000, 0x9);
    inject(ENGINE_EVENT_SOURCE_MODULE, EVENT_ID_EOS_RENDERED);

    assert_eq!(
        *data_hits.lock(),
        vec![(42, EVENT_ID_WRITE_DONE), (42, EVENT_ID_EOS_RENDERED)]
    );
    assert_eq!(*module_hits.lock(), vec![(42, 0x9)]);

    // Unsubscribe the data-path listener; module events keep flowing.
    m.session_register_cb(42, None, EventType::DataPath, 1);
    inject(ENGINE_EVENT_SOURCE_MODULE, EVENT_ID_WRITE_DONE);
    inject(0x5000, 0xA);
    assert_eq!(data_hits.lock().len(), 2);
    assert_eq!(module_hits.lock().len(), 2);
}

#[test]
fn duplicate_connect_is_already() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_metadata(3, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(3, 0, true).unwrap();
    m.session_open(3).unwrap();

    assert!(matches!(
        m.session_aif_connect(3, 0, true),
        Err(AgmError::Already(_))
    ));
    assert_eq!(aif_state(&f, 3, 0), AifState::Opened);

    m.session_aif_connect(3, 0, false).unwrap();
    assert!(matches!(
        m.session_aif_connect(3, 0, false),
        Err(AgmError::Already(_))
    ));
}

#[test]
fn open_without_staged_interface_is_no_attachment() {
    let f = fixture();
    assert!(matches!(
        f.manager.session_open(9),
        Err(AgmError::NoAifAttached)
    ));
    assert_eq!(session_state(&f, 9), SessionState::Closed);
}

#[test]
fn cached_params_replayed_on_reopen() {
    let f = fixture();
    let m = &f.manager;

    let blob = vec![0u8; 24];
    m.session_set_params(1, &blob).unwrap();
    m.session_set_metadata(1, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(1, 0, true).unwrap();

    m.session_open(1).unwrap();
    let set_configs = |engine: &MockEngine| {
        engine
            .commands()
            .iter()
            .filter(|c| matches!(c, MockCommand::SetConfig { .. }))
            .count()
    };
    assert_eq!(set_configs(&f.engine), 1);

    m.session_close(1).unwrap();
    f.engine.clear_commands();

    m.session_aif_connect(1, 0, true).unwrap();
    m.session_open(1).unwrap();
    assert_eq!(set_configs(&f.engine), 1);
}

#[test]
fn aif_info_two_pass() {
    let f = fixture();

    let mut count = 0;
    f.manager.get_aif_info_list(None, &mut count);
    assert_eq!(count, 5);

    let empty = agm_core::AifInfo {
        name: String::new(),
        direction: Direction::Rx,
    };
    let mut list = vec![empty; 5];
    let mut count = 5;
    f.manager.get_aif_info_list(Some(&mut list), &mut count);
    assert_eq!(count, 5);
    assert_eq!(list[0].name, "Speaker");
    assert_eq!(list[4].direction, Direction::Tx);
}

#[test]
fn tag_module_info_two_pass() {
    let f = fixture();
    let m = &f.manager;
    m.session_set_metadata(2, &gkv_bytes(&[(1, 100)])).unwrap();

    let mut size = 0;
    m.session_aif_get_tag_module_info(2, 0, None, &mut size)
        .unwrap();
    // Six tags, one module each.
    assert_eq!(size, 4 + 6 * 16);

    let mut payload = vec![0u8; size];
    m.session_aif_get_tag_module_info(2, 0, Some(&mut payload), &mut size)
        .unwrap();
    assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 6);
}

#[test]
fn session_time_and_processed_count() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_metadata(6, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(6, 0, true).unwrap();
    m.session_open(6).unwrap();
    m.session_prepare(6).unwrap();
    m.session_start(6).unwrap();

    f.engine.set_session_time(0x11_2233_4455);
    assert_eq!(m.get_session_time(6).unwrap(), 0x11_2233_4455);

    m.session_write(6, &[0u8; 64]).unwrap();
    m.session_write(6, &[0u8; 64]).unwrap();
    assert_eq!(
        m.get_hw_processed_buff_cnt(6, Direction::Rx).unwrap(),
        2
    );
}

#[test]
fn calibration_updates_all_three_bundles() {
    let f = fixture();
    let m = &f.manager;

    let mut meta = Metadata {
        gkv: KeyVector::from_pairs([(1, 100)]),
        ..Metadata::default()
    };
    meta.ckv.push(KeyValue::new(50, 1));
    m.session_set_metadata(8, &meta.to_bytes()).unwrap();
    m.session_aif_connect(8, 0, true).unwrap();

    // Calibration before the attachment is realized is a state error.
    let patch = KeyVector::from_pairs([(50, 9), (51, 2)]);
    assert!(matches!(
        m.session_aif_set_cal(8, 0, &patch),
        Err(AgmError::InvalidState(_))
    ));

    m.session_open(8).unwrap();
    m.session_aif_set_cal(8, 0, &patch).unwrap();

    let cal = f
        .engine
        .commands()
        .into_iter()
        .find_map(|c| match c {
            MockCommand::SetCal { ckv } => Some(ckv),
            _ => None,
        })
        .unwrap();
    // The overwritten value wins and the new key is appended.
    assert!(cal.entries().contains(&KeyValue::new(50, 9)));
    assert!(cal.entries().contains(&KeyValue::new(51, 2)));
    assert!(!cal.entries().contains(&KeyValue::new(50, 1)));
}

#[test]
fn eos_needs_an_open_session() {
    let f = fixture();
    let m = &f.manager;

    assert!(matches!(m.session_eos(12), Err(AgmError::InvalidState(_))));

    m.session_set_metadata(12, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(12, 0, true).unwrap();
    m.session_open(12).unwrap();
    m.session_eos(12).unwrap();
    assert!(f
        .engine
        .commands()
        .iter()
        .any(|c| matches!(c, MockCommand::Eos)));
}

#[test]
fn media_config_conflict_while_in_use() {
    let f = fixture();
    let m = &f.manager;

    m.aif_set_media_config(0, &MediaConfig::default()).unwrap();
    m.session_set_metadata(13, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(13, 0, true).unwrap();
    m.session_open(13).unwrap();

    let other = MediaConfig {
        rate: 44_100,
        ..MediaConfig::default()
    };
    assert!(m.aif_set_media_config(0, &other).is_err());
    m.session_close(13).unwrap();
    m.aif_set_media_config(0, &other).unwrap();
}

#[test]
fn detach_of_last_interface_stops_only_its_subgraph() {
    let f = fixture();
    let m = &f.manager;

    m.session_set_metadata(14, &gkv_bytes(&[(1, 100)])).unwrap();
    m.session_aif_connect(14, 0, true).unwrap();
    m.session_aif_connect(14, 1, true).unwrap();
    m.session_open(14).unwrap();

    f.engine.clear_commands();

    // Two realized interfaces: the first detach removes a subgraph.
    m.session_aif_connect(14, 1, false).unwrap();
    assert!(f
        .engine
        .commands()
        .iter()
        .any(|c| matches!(c, MockCommand::RemoveGraph { .. })));
    assert_eq!(aif_state(&f, 14, 1), AifState::Closed);
    assert_eq!(m.devices().get(1).unwrap().open_refcount(), 0);
}
