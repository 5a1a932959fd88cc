use super::helpers::{run_processes, single_process};
use shardsync::{BufferKind, DataType, SyncConfig};

/// Fill a replica's parameters with `rank + 1` on its own shard and garbage elsewhere.
fn seed(len: usize, shard: std::ops::Range<usize>, rank: usize) -> Vec<f32> {
    (0..len)
        .map(|i| if shard.contains(&i) { (rank + 1) as f32 } else { -99.0 })
        .collect()
}

fn concatenation(num_ranks: usize, shard_size: usize) -> Vec<f32> {
    (0..num_ranks)
        .flat_map(|r| std::iter::repeat_n((r + 1) as f32, shard_size))
        .collect()
}

#[test]
fn test_gather_4_devices() {
    let (sync, replicas) = single_process(4, DataType::F32, 12, &SyncConfig::default());
    for (i, r) in replicas.iter().enumerate() {
        r.load_f32(BufferKind::Params, &seed(12, sync.local_shard_range(i), i))
            .unwrap();
    }

    sync.all_gather_params().unwrap();

    let want = concatenation(4, 3);
    for (i, r) in replicas.iter().enumerate() {
        assert_eq!(r.to_f32(BufferKind::Params).unwrap(), want, "device {i}");
    }
}

#[test]
fn test_gather_leaves_gradients_alone() {
    let (sync, replicas) = single_process(2, DataType::F32, 4, &SyncConfig::default());
    replicas[1].load_f32(BufferKind::Grads, &[9.0; 4]).unwrap();
    sync.all_gather_params().unwrap();
    assert_eq!(replicas[1].to_f32(BufferKind::Grads).unwrap(), vec![9.0; 4]);
}

#[test]
fn test_single_device_is_identity() {
    let (sync, replicas) = single_process(1, DataType::F32, 3, &SyncConfig::default());
    replicas[0].load_f32(BufferKind::Params, &[1.0, 2.0, 3.0]).unwrap();
    sync.all_gather_params().unwrap();
    assert_eq!(
        replicas[0].to_f32(BufferKind::Params).unwrap(),
        vec![1.0, 2.0, 3.0]
    );
}

#[test]
fn test_f16_params() {
    let (sync, replicas) = single_process(2, DataType::F16, 4, &SyncConfig::default());
    replicas[0].load_f32(BufferKind::Params, &[0.5, 1.0, 0.0, 0.0]).unwrap();
    replicas[1].load_f32(BufferKind::Params, &[0.0, 0.0, -2.0, 8.0]).unwrap();
    sync.all_gather_params().unwrap();
    for r in &replicas {
        assert_eq!(r.to_f32(BufferKind::Params).unwrap(), vec![0.5, 1.0, -2.0, 8.0]);
    }
}

#[test]
fn test_reduce_then_gather_step() {
    // one training step: reduce gradients, "optimize" the local shard, redistribute
    let (sync, replicas) = single_process(2, DataType::F32, 4, &SyncConfig::default());
    for r in &replicas {
        r.load_f32(BufferKind::Grads, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    }
    sync.scatter_reduce_and_reset_grads().unwrap();
    for r in &replicas {
        r.load_f32(BufferKind::Params, &r.to_f32(BufferKind::Grads).unwrap())
            .unwrap();
    }
    sync.all_gather_params().unwrap();
    for r in &replicas {
        assert_eq!(r.to_f32(BufferKind::Params).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    }
}

#[test]
fn test_gather_2_processes_2_devices() {
    run_processes(2, 2, DataType::F32, 8, |sync, replicas| {
        for (i, r) in replicas.iter().enumerate() {
            r.load_f32(
                BufferKind::Params,
                &seed(8, sync.local_shard_range(i), sync.global_rank(i)),
            )
            .unwrap();
        }

        sync.all_gather_params().unwrap();

        let want = concatenation(4, 2);
        for r in replicas {
            assert_eq!(r.to_f32(BufferKind::Params).unwrap(), want);
        }
    });
}
