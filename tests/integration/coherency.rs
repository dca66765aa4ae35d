//! Replica movement between memory nodes as seen through whole jobs.

use std::sync::Arc;

use codelet_rt::{Codelet, Layout, PolicyKind, Runtime, TaskBuilder, HOST_NODE};

use crate::common::{config, increment_cuda, runtime};

#[test]
fn test_write_on_accelerator_then_read_on_host_copies_once() {
    let rt = runtime(1, 1, PolicyKind::Eager);
    let fill = Arc::new(Codelet::new("fill").nbuffers(1).cuda(|bufs, _| {
        let v = bufs.get_mut(0);
        for i in 0..v.len::<u32>() {
            v.set(i, i as u32 + 1);
        }
        Ok(())
    }));
    let sum = Arc::new(Codelet::new("sum").nbuffers(2).cpu(|bufs, _| {
        let (out, v) = bufs.pair_mut(1, 0);
        let total: u32 = (0..v.len::<u32>()).map(|i| v.get::<u32>(i)).sum();
        out.set(0, total);
        Ok(())
    }));

    let data = rt.register_handle(HOST_NODE, Layout::vector_of::<u32>(4)).unwrap();
    let out = rt.register_variable(0u32).unwrap();
    rt.submit(TaskBuilder::new(&fill).write(&data)).unwrap();
    rt.submit(TaskBuilder::new(&sum).read(&data).write(&out)).unwrap();
    rt.wait_for_all();

    let stats = rt.stats();
    assert_eq!(stats.transfers, 1);
    assert_eq!(stats.transferred_bytes, 16);

    // The host copy is already valid, so bringing the data home is free.
    assert_eq!(rt.unregister_vector::<u32>(&data).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(rt.unregister_vector::<u32>(&out).unwrap(), vec![10]);
    assert_eq!(rt.stats().transfers, 1);
}

#[test]
fn test_host_content_reaches_accelerator_and_back() {
    let rt = runtime(1, 1, PolicyKind::Eager);
    let h = rt.register_vector(&[7u32, 8, 9]).unwrap();
    rt.submit(TaskBuilder::new(&increment_cuda()).read_write(&h)).unwrap();
    assert_eq!(rt.unregister_vector::<u32>(&h).unwrap(), vec![8, 9, 10]);
    // Host to accelerator, then accelerator to host.
    assert_eq!(rt.stats().transfers, 2);
}

#[test]
fn test_eviction_under_small_accelerator_memory() {
    let mut cfg = config(0, 1, PolicyKind::Eager);
    cfg.memory.accelerator_capacity = Some(64);
    cfg.worker.pipeline_depth = 1;
    let rt = Runtime::new(cfg).unwrap();

    let tiles: Vec<_> = (0..4u32)
        .map(|t| rt.register_vector(&[t; 16]).unwrap())
        .collect();
    let inc = increment_cuda();
    for _ in 0..2 {
        for tile in &tiles {
            rt.submit(TaskBuilder::new(&inc).read_write(tile)).unwrap();
        }
    }
    rt.wait_for_all();
    assert_eq!(rt.stats().completed, 8);

    for (t, tile) in tiles.iter().enumerate() {
        assert_eq!(rt.unregister_vector::<u32>(tile).unwrap(), vec![t as u32 + 2; 16]);
    }
}
