use shardsync::collective::{CollectiveBackend, RendezvousId};
use shardsync::host::{HostComm, HostStream};
use shardsync::{
    CollectiveChannel, DataType, Device, DeviceBuffers, DeviceKind, HostBackend, ProcessGroup,
    SyncConfig, SyncError, TcpProcessGroup,
};
use std::sync::{Arc, Mutex};

/// Host backend that records bracket and init calls, and can fail on demand.
#[derive(Default)]
struct RecordingBackend {
    inner: HostBackend,
    log: Arc<Mutex<Vec<String>>>,
    watch_signal: i32,
    fail_init_rank: Option<usize>,
    fail_collectives: bool,
}

impl RecordingBackend {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

fn thread_blocks(signal: i32) -> bool {
    unsafe {
        let mut cur: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut cur);
        libc::sigismember(&cur, signal) == 1
    }
}

impl CollectiveBackend for RecordingBackend {
    type Stream = HostStream;
    type Comm = HostComm;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn unique_id(&self) -> shardsync::Result<RendezvousId> {
        self.inner.unique_id()
    }

    fn create_stream(&self, device: Device) -> shardsync::Result<HostStream> {
        self.inner.create_stream(device)
    }

    fn group_start(&self) -> shardsync::Result<()> {
        self.record("start");
        self.inner.group_start()
    }

    fn group_end(&self) -> shardsync::Result<()> {
        self.record("end");
        self.inner.group_end()
    }

    fn comm_init_rank(
        &self,
        device: Device,
        num_ranks: usize,
        id: &RendezvousId,
        rank: usize,
    ) -> shardsync::Result<HostComm> {
        self.record(format!("init blocked={}", thread_blocks(self.watch_signal)));
        if self.fail_init_rank == Some(rank) {
            return Err(SyncError::collective("recordingCommInitRank", "injected failure"));
        }
        self.inner.comm_init_rank(device, num_ranks, id, rank)
    }

    unsafe fn reduce_scatter(
        &self,
        comm: &HostComm,
        stream: &HostStream,
        send_ptr: u64,
        recv_ptr: u64,
        recv_count: usize,
        dtype: DataType,
    ) -> shardsync::Result<()> {
        if self.fail_collectives {
            return Err(SyncError::collective("recordingReduceScatter", "injected failure"));
        }
        unsafe {
            self.inner
                .reduce_scatter(comm, stream, send_ptr, recv_ptr, recv_count, dtype)
        }
    }

    unsafe fn all_gather(
        &self,
        comm: &HostComm,
        stream: &HostStream,
        send_ptr: u64,
        recv_ptr: u64,
        send_count: usize,
        dtype: DataType,
    ) -> shardsync::Result<()> {
        unsafe {
            self.inner
                .all_gather(comm, stream, send_ptr, recv_ptr, send_count, dtype)
        }
    }

    fn synchronize(&self, stream: &HostStream) -> shardsync::Result<()> {
        self.inner.synchronize(stream)
    }
}

fn cpus(n: usize) -> Vec<Device> {
    (0..n).map(Device::cpu).collect()
}

fn local_channel(devices: usize) -> CollectiveChannel<HostBackend> {
    CollectiveChannel::new(
        HostBackend::new(),
        (0..devices).map(Device::cpu).collect(),
        None,
        &SyncConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_local_ranks_follow_device_order() {
    let channel = local_channel(3);
    assert_eq!(channel.num_ranks(), 3);
    assert_eq!(channel.local_count(), 3);
    assert_eq!((0..3).map(|i| channel.global_rank(i)).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(channel.process_group().is_none());
}

#[test]
fn test_broadcast_single_process_is_noop() {
    let channel = local_channel(2);
    let mut buf = vec![1u8, 2, 3];
    channel.broadcast(&mut buf, 1).unwrap();
    assert_eq!(buf, vec![1, 2, 3]);
    assert!(matches!(
        channel.broadcast(&mut buf, 2),
        Err(SyncError::ProcessLayout { .. })
    ));
}

#[test]
fn test_reduce_scatter_raw_buffers() {
    let channel = local_channel(2);
    let send = [vec![1.0f32, 2.0, 3.0, 4.0], vec![10.0f32, 20.0, 30.0, 40.0]];
    let mut recv = [vec![0.0f32; 2], vec![0.0f32; 2]];
    let buffers: Vec<DeviceBuffers> = send
        .iter()
        .zip(recv.iter_mut())
        .map(|(s, r)| DeviceBuffers {
            send_ptr: s.as_ptr() as u64,
            recv_ptr: r.as_mut_ptr() as u64,
        })
        .collect();
    unsafe { channel.reduce_scatter(&buffers, 2, DataType::F32).unwrap() };
    assert_eq!(recv[0], vec![11.0, 22.0]);
    assert_eq!(recv[1], vec![33.0, 44.0]);
}

#[test]
fn test_collective_checks_inputs() {
    let channel = local_channel(2);
    let data = vec![0.0f32; 4];
    let one = [DeviceBuffers {
        send_ptr: data.as_ptr() as u64,
        recv_ptr: data.as_ptr() as u64,
    }];
    let res = unsafe { channel.all_gather(&one, 2, DataType::F32) };
    assert!(matches!(res, Err(SyncError::ProcessLayout { .. })));

    let two = [one[0], one[0]];
    let res = unsafe { channel.all_gather(&two, 1, DataType::I32) };
    assert!(matches!(res, Err(SyncError::UnsupportedPrecision { .. })));
}

#[test]
fn test_multi_process_ranks_and_broadcast() {
    let groups = TcpProcessGroup::bootstrap_local(2).unwrap();
    std::thread::scope(|s| {
        for group in groups {
            s.spawn(move || {
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let me = group.rank();
                let channel = CollectiveChannel::new(
                    HostBackend::new(),
                    vec![Device::cpu(0), Device::cpu(1)],
                    Some(Arc::clone(&group)),
                    &SyncConfig::default(),
                )
                .unwrap();
                assert_eq!(channel.num_ranks(), 4);
                assert_eq!(channel.global_rank(1), me * 2 + 1);

                // global rank 3 lives on process 1
                let mut buf = if me == 1 { vec![42u8; 4] } else { vec![0u8; 4] };
                channel.broadcast(&mut buf, 3).unwrap();
                assert_eq!(buf, vec![42u8; 4]);
                group.barrier().unwrap();
            });
        }
    });
}

#[test]
fn test_signal_masked_only_during_communicator_init() {
    let sig = libc::SIGURG;
    let backend = RecordingBackend {
        watch_signal: sig,
        ..Default::default()
    };
    let log = Arc::clone(&backend.log);
    assert!(!thread_blocks(sig));
    let config = SyncConfig::default().with_mask_signal(Some(sig));
    let channel = CollectiveChannel::new(backend, cpus(2), None, &config).unwrap();
    assert!(!thread_blocks(sig));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start", "init blocked=true", "init blocked=true", "end"]
    );
    drop(channel);
}

#[test]
fn test_no_mask_when_disabled() {
    let backend = RecordingBackend {
        watch_signal: libc::SIGURG,
        ..Default::default()
    };
    let log = Arc::clone(&backend.log);
    let config = SyncConfig::default().with_mask_signal(None);
    let _channel = CollectiveChannel::new(backend, cpus(1), None, &config).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["start", "init blocked=false", "end"]);
}

#[test]
fn test_failed_init_still_closes_group_and_restores_mask() {
    let sig = libc::SIGURG;
    let backend = RecordingBackend {
        watch_signal: sig,
        fail_init_rank: Some(1),
        ..Default::default()
    };
    let log = Arc::clone(&backend.log);
    let config = SyncConfig::default().with_mask_signal(Some(sig));
    let err = CollectiveChannel::new(backend, cpus(3), None, &config)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SyncError::Collective {
            call: "recordingCommInitRank",
            ..
        }
    ));
    assert!(!err.is_configuration());
    assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("end"));
    assert!(!thread_blocks(sig));
}

#[test]
fn test_failed_collective_still_closes_group() {
    let backend = RecordingBackend {
        fail_collectives: true,
        ..Default::default()
    };
    let log = Arc::clone(&backend.log);
    let channel = CollectiveChannel::new(backend, cpus(2), None, &SyncConfig::default()).unwrap();
    log.lock().unwrap().clear();

    let data = vec![0.0f32; 4];
    let buffers = [DeviceBuffers {
        send_ptr: data.as_ptr() as u64,
        recv_ptr: data.as_ptr() as u64,
    }; 2];
    let res = unsafe { channel.reduce_scatter(&buffers, 2, DataType::F32) };
    assert!(matches!(res, Err(SyncError::Collective { .. })));
    assert_eq!(*log.lock().unwrap(), vec!["start", "end"]);
}

#[test]
fn test_uneven_device_counts_rejected_on_every_process() {
    let groups = TcpProcessGroup::bootstrap_local(2).unwrap();
    std::thread::scope(|s| {
        for group in groups {
            s.spawn(move || {
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let devices = if group.rank() == 0 { 2 } else { 1 };
                let err = CollectiveChannel::new(
                    HostBackend::new(),
                    cpus(devices),
                    Some(Arc::clone(&group)),
                    &SyncConfig::default(),
                )
                .err()
                .unwrap();
                assert!(
                    matches!(err, SyncError::ProcessLayout { .. }),
                    "process {}: {err}",
                    group.rank()
                );
                assert!(err.is_configuration());
            });
        }
    });
}
