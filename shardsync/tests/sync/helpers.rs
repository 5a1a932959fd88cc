use shardsync::{
    DataType, Device, DeviceReplica, DistributedSynchronizer, HostBackend, HostReplica,
    ProcessGroup, SyncConfig, TcpProcessGroup,
};
use std::sync::Arc;

pub type HostSync = DistributedSynchronizer<HostBackend>;

/// `n` zeroed host replicas of `len` elements on devices `cpu:0..n`.
pub fn host_replicas(n: usize, dtype: DataType, len: usize) -> Vec<Arc<HostReplica>> {
    (0..n)
        .map(|i| Arc::new(HostReplica::new(Device::cpu(i), dtype, len)))
        .collect()
}

pub fn as_dyn(replicas: &[Arc<HostReplica>]) -> Vec<Arc<dyn DeviceReplica>> {
    replicas
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn DeviceReplica>)
        .collect()
}

/// Single-process synchronizer over `devices` host replicas.
pub fn single_process(
    devices: usize,
    dtype: DataType,
    len: usize,
    config: &SyncConfig,
) -> (HostSync, Vec<Arc<HostReplica>>) {
    let replicas = host_replicas(devices, dtype, len);
    let sync = DistributedSynchronizer::new(
        HostBackend::from_config(config),
        as_dyn(&replicas),
        None,
        config,
    )
    .unwrap();
    (sync, replicas)
}

/// Run `f` on `num_processes` synchronizers, one per thread, each driving
/// `devices` host replicas and joined by a loopback TCP process group.
/// Keeps every synchronizer alive until all threads have finished.
pub fn run_processes<F>(num_processes: usize, devices: usize, dtype: DataType, len: usize, f: F)
where
    F: Fn(&HostSync, &[Arc<HostReplica>]) + Sync,
{
    let groups = TcpProcessGroup::bootstrap_local(num_processes).unwrap();
    let config = SyncConfig::default();
    std::thread::scope(|s| {
        for group in groups {
            let f = &f;
            let config = &config;
            s.spawn(move || {
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let replicas = host_replicas(devices, dtype, len);
                let sync = DistributedSynchronizer::new(
                    HostBackend::from_config(config),
                    as_dyn(&replicas),
                    Some(Arc::clone(&group)),
                    config,
                )
                .unwrap();
                f(&sync, &replicas);
                // nobody tears down while a peer may still be exchanging
                group.barrier().unwrap();
            });
        }
    });
}
