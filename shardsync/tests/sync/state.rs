use super::helpers::{run_processes, single_process};
use shardsync::{CheckpointItem, DataType, SyncConfig, SyncError};
use std::sync::Mutex;

/// Split `item` with scatter_state, returning each local device's slice.
fn scatter(sync: &super::helpers::HostSync, item: &CheckpointItem) -> Vec<Vec<u8>> {
    let mut slices = vec![Vec::new(); sync.local_count()];
    sync.scatter_state(item, |i, bytes| {
        slices[i] = bytes.to_vec();
        Ok(())
    })
    .unwrap();
    slices
}

fn gather(sync: &super::helpers::HostSync, name: &str, dtype: DataType, slices: &[Vec<u8>]) -> CheckpointItem {
    sync.gather_state(|i| Ok(CheckpointItem::new(name, dtype, slices[i].clone())))
        .unwrap()
}

#[test]
fn test_scatter_slices_by_global_rank() {
    let (sync, _replicas) = single_process(4, DataType::F32, 8, &SyncConfig::default());
    let item = CheckpointItem::from_f32("moments", &(0..8).map(|i| i as f32).collect::<Vec<_>>());
    let slices = scatter(&sync, &item);
    for (i, slice) in slices.iter().enumerate() {
        let piece = CheckpointItem::new("", DataType::F32, slice.clone());
        assert_eq!(piece.to_f32(), vec![(2 * i) as f32, (2 * i + 1) as f32]);
    }
}

#[test]
fn test_roundtrip_single_process() {
    let (sync, _replicas) = single_process(3, DataType::F32, 6, &SyncConfig::default());
    let values: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
    let item = CheckpointItem::from_f32("adam_m", &values);

    let slices = scatter(&sync, &item);
    let back = gather(&sync, "adam_m", DataType::F32, &slices);

    assert_eq!(back, item);
}

#[test]
fn test_roundtrip_uneven_item() {
    // 10 elements over 3 ranks: 4 + 4 + 2
    let (sync, _replicas) = single_process(3, DataType::F32, 3, &SyncConfig::default());
    let item = CheckpointItem::from_f32("v", &(0..10).map(|i| i as f32).collect::<Vec<_>>());

    let slices = scatter(&sync, &item);
    assert_eq!(
        slices.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![16, 16, 8]
    );
    assert_eq!(gather(&sync, "v", DataType::F32, &slices), item);
}

#[test]
fn test_trailing_ranks_get_empty_slices() {
    // 5 elements over 4 ranks: 2 + 2 + 1 + 0
    let (sync, _replicas) = single_process(4, DataType::F32, 4, &SyncConfig::default());
    let item = CheckpointItem::from_f32("tiny", &[1.0, 2.0, 3.0, 4.0, 5.0]);
    let slices = scatter(&sync, &item);
    assert_eq!(
        slices.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![8, 8, 4, 0]
    );
    assert_eq!(gather(&sync, "tiny", DataType::F32, &slices), item);
}

#[test]
fn test_byte_items_slice_per_byte() {
    let (sync, _replicas) = single_process(2, DataType::F32, 2, &SyncConfig::default());
    let item = CheckpointItem::new("blob", DataType::U8, (0u8..7).collect());
    let slices = scatter(&sync, &item);
    assert_eq!(slices, vec![vec![0, 1, 2, 3], vec![4, 5, 6]]);
}

#[test]
fn test_scatter_rejects_partial_element() {
    let (sync, _replicas) = single_process(2, DataType::F32, 2, &SyncConfig::default());
    let item = CheckpointItem::new("bad", DataType::F32, vec![0u8; 6]);
    let err = sync.scatter_state(&item, |_, _| Ok(())).unwrap_err();
    assert!(matches!(err, SyncError::ItemMismatch { .. }));
}

#[test]
fn test_setter_error_propagates() {
    let (sync, _replicas) = single_process(2, DataType::F32, 2, &SyncConfig::default());
    let item = CheckpointItem::from_f32("x", &[1.0, 2.0]);
    let err = sync
        .scatter_state(&item, |i, _| {
            if i == 1 {
                Err(SyncError::messaging("optimizer refused shard"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
    assert!(err.to_string().contains("optimizer refused shard"));
}

#[test]
fn test_gather_rejects_mixed_types() {
    let (sync, _replicas) = single_process(2, DataType::F32, 2, &SyncConfig::default());
    let res = sync.gather_state(|i| {
        let dtype = if i == 0 { DataType::F32 } else { DataType::F16 };
        Ok(CheckpointItem::new("mixed", dtype, vec![0u8; 4]))
    });
    assert!(matches!(res, Err(SyncError::ItemMismatch { .. })));
}

#[test]
fn test_roundtrip_2_processes_2_devices() {
    let values: Vec<f32> = (0..16).map(|i| i as f32 - 3.0).collect();
    let item = CheckpointItem::from_f32("adam_v", &values);
    run_processes(2, 2, DataType::F32, 8, |sync, _replicas| {
        let slices = scatter(sync, &item);
        // local slices belong to this process's global ranks
        let first = sync.global_rank(0) * 4 * 4;
        assert_eq!(slices[0], item.bytes[first..first + 16].to_vec());

        let back = gather(sync, "adam_v", DataType::F32, &slices);
        assert_eq!(back, item);
    });
}

#[test]
fn test_gather_orders_by_process_then_device() {
    let seen = Mutex::new(Vec::new());
    run_processes(3, 2, DataType::F32, 6, |sync, _replicas| {
        let gathered = sync
            .gather_state(|i| {
                let rank = sync.global_rank(i) as u8;
                Ok(CheckpointItem::new("ranks", DataType::U8, vec![rank; 2]))
            })
            .unwrap();
        seen.lock().unwrap().push(gathered.bytes);
    });
    let want: Vec<u8> = (0u8..6).flat_map(|r| [r, r]).collect();
    for bytes in seen.into_inner().unwrap() {
        assert_eq!(bytes, want);
    }
}
