// ============================================================================
// tests/features_test.rs - Set/Get Features シナリオ
// ============================================================================
//!
//! Temperature Thresholdの境界値掃引とFeature保存値の検証

use std::sync::Arc;
use std::time::Duration;

use nvme_conformance::nvme::{
    FeatureSelect, GetFeatures, LoopbackDevice, QueueConfig, QueuePair, QueueState, SetFeatures,
    feature_ids, send_and_reap,
};
use nvme_conformance::time::NANOS_PER_MICRO;
use nvme_conformance::ManualClock;

const TIMEOUT: Duration = Duration::from_millis(1);

fn admin_pair() -> (Arc<LoopbackDevice>, QueuePair) {
    let device = LoopbackDevice::new(Arc::new(ManualClock::with_relax_step(NANOS_PER_MICRO)));
    let mut qp = device.queue_pair(QueueConfig::admin()).unwrap();
    qp.transition(QueueState::Created).unwrap();
    qp.transition(QueueState::Active).unwrap();
    (device, qp)
}

/// 2のべき乗ごとに pow2-1, pow2, pow2+1 を返す（16ビットで飽和）
fn tmpth_sweep() -> Vec<u16> {
    let mut values = Vec::new();
    let mut pow2: u32 = 1;
    while pow2 <= 0x8000 {
        for v in pow2 - 1..=pow2 + 1 {
            values.push(v.min(0xFFFF) as u16);
        }
        pow2 <<= 1;
    }
    values
}

#[test]
fn test_temperature_threshold_sweep() {
    let (_device, mut qp) = admin_pair();

    let values = tmpth_sweep();
    assert_eq!(values.first(), Some(&0));
    assert_eq!(values.last(), Some(&0x8001));

    for tmpth in values {
        let mut set = SetFeatures::new();
        set.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        set.set_temp_threshold_tmpth(tmpth).unwrap();
        send_and_reap(&mut qp, &set, TIMEOUT, true).unwrap();

        let mut get = GetFeatures::new();
        get.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        let ce = send_and_reap(&mut qp, &get, TIMEOUT, false).unwrap();
        assert!(ce.is_success(), "TMPTH {:#06x}: {:?}", tmpth, ce.status());
        assert_eq!(
            ce.result_field(0).unwrap() & 0xFFFF,
            tmpth as u32,
            "TMPTH {:#06x} not read back",
            tmpth
        );
    }
}

#[test]
fn test_saved_value_survives_reset() {
    let (device, mut qp) = admin_pair();

    let mut set = SetFeatures::new();
    set.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
    set.set_temp_threshold_tmpth(0x0150).unwrap();
    set.set_save(true).unwrap();
    send_and_reap(&mut qp, &set, TIMEOUT, true).unwrap();

    let mut volatile = SetFeatures::new();
    volatile.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
    volatile.set_temp_threshold_tmpth(0x0160).unwrap();
    send_and_reap(&mut qp, &volatile, TIMEOUT, true).unwrap();

    qp.transition(QueueState::Created).unwrap();
    device.reset();
    qp.transition(QueueState::Active).unwrap();

    let mut get = GetFeatures::new();
    get.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
    let ce = send_and_reap(&mut qp, &get, TIMEOUT, true).unwrap();
    assert_eq!(ce.result_field(0).unwrap(), 0x0150);

    get.set_sel(FeatureSelect::Default as u8).unwrap();
    let ce = send_and_reap(&mut qp, &get, TIMEOUT, true).unwrap();
    assert_eq!(ce.result_field(0).unwrap(), 0x0157);
}

#[test]
fn test_number_of_queues_is_clamped() {
    let (_device, mut qp) = admin_pair();

    let mut set = SetFeatures::new();
    set.set_fid(feature_ids::NUM_QUEUES).unwrap();
    set.set_num_queues(0x00FF, 3).unwrap();
    let ce = send_and_reap(&mut qp, &set, TIMEOUT, true).unwrap();
    assert_eq!(ce.result_field(0).unwrap(), (3 << 16) | 63);
}

#[test]
fn test_interrupt_vector_coalescing_round_trip() {
    let (_device, mut qp) = admin_pair();

    let mut set = SetFeatures::new();
    set.set_fid(feature_ids::IRQ_CONFIG).unwrap();
    set.set_int_vec_config(4, true).unwrap();
    send_and_reap(&mut qp, &set, TIMEOUT, true).unwrap();

    let mut get = GetFeatures::new();
    get.set_fid(feature_ids::IRQ_CONFIG).unwrap();
    get.set_int_vec_config_iv(4).unwrap();
    let ce = send_and_reap(&mut qp, &get, TIMEOUT, true).unwrap();
    assert_eq!(ce.result_field(0).unwrap(), 4 | (1 << 16));

    get.set_int_vec_config_iv(5).unwrap();
    let ce = send_and_reap(&mut qp, &get, TIMEOUT, true).unwrap();
    assert_eq!(ce.result_field(0).unwrap(), 5);
}
