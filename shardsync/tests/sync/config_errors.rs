use super::helpers::{as_dyn, host_replicas};
use shardsync::{
    DataType, Device, DeviceReplica, DistributedSynchronizer, HostBackend, HostReplica,
    SyncConfig, SyncError,
};
use std::sync::Arc;

fn build(replicas: Vec<Arc<dyn DeviceReplica>>) -> Result<(), SyncError> {
    DistributedSynchronizer::new(HostBackend::new(), replicas, None, &SyncConfig::default())
        .map(|_| ())
}

#[test]
fn test_uneven_split_rejected() {
    let err = build(as_dyn(&host_replicas(3, DataType::F32, 10))).unwrap_err();
    assert!(matches!(
        err,
        SyncError::UnevenShards {
            total: 10,
            num_shards: 3
        }
    ));
    assert!(err.is_configuration());
}

#[test]
fn test_even_split_accepted() {
    let replicas = host_replicas(3, DataType::F32, 12);
    let sync = DistributedSynchronizer::new(
        HostBackend::new(),
        as_dyn(&replicas),
        None,
        &SyncConfig::default(),
    )
    .unwrap();
    assert_eq!(sync.shard_size(), 4);
    assert_eq!(
        (0..3).map(|i| sync.local_shard_range(i)).collect::<Vec<_>>(),
        vec![0..4, 4..8, 8..12]
    );
}

#[test]
fn test_no_devices_rejected() {
    assert!(matches!(build(Vec::new()), Err(SyncError::NoDevices)));
}

#[test]
fn test_gpu_device_rejected_by_host_backend() {
    let replicas: Vec<Arc<dyn DeviceReplica>> = vec![
        Arc::new(HostReplica::new(Device::cpu(0), DataType::F32, 4)),
        Arc::new(HostReplica::new(Device::gpu(1), DataType::F32, 4)),
    ];
    let err = build(replicas).unwrap_err();
    assert!(matches!(
        err,
        SyncError::UnsupportedDevice {
            backend: "host",
            ..
        }
    ));
    assert!(err.to_string().contains("gpu:1"));
}

#[test]
fn test_mismatched_replicas_rejected() {
    let replicas: Vec<Arc<dyn DeviceReplica>> = vec![
        Arc::new(HostReplica::new(Device::cpu(0), DataType::F32, 4)),
        Arc::new(HostReplica::new(Device::cpu(1), DataType::F32, 6)),
    ];
    assert!(matches!(
        build(replicas),
        Err(SyncError::ReplicaMismatch { index: 1, .. })
    ));

    let replicas: Vec<Arc<dyn DeviceReplica>> = vec![
        Arc::new(HostReplica::new(Device::cpu(0), DataType::F32, 4)),
        Arc::new(HostReplica::new(Device::cpu(1), DataType::F16, 4)),
    ];
    assert!(matches!(
        build(replicas),
        Err(SyncError::ReplicaMismatch { .. })
    ));
}

#[test]
fn test_unsupported_precision_rejected() {
    let err = build(as_dyn(&host_replicas(2, DataType::BF16, 4))).unwrap_err();
    assert!(matches!(
        err,
        SyncError::UnsupportedPrecision {
            dtype: DataType::BF16,
            ..
        }
    ));
    assert!(err.is_configuration());
}
