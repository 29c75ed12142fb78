use std::{sync::Arc, thread};

use nanorun_compute::{
    Bootstrapper, ComputeContext, DeviceRequest, FixedProbe, LaunchEnv, LaunchSignals, LocalHub,
};

/// Runs `f` on `world_size` threads, each holding a CPU context joined to one
/// in-process group. Results come back indexed by rank.
pub fn run_local_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ComputeContext) -> T + Send + Sync + 'static,
{
    let hub = LocalHub::new(world_size);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let member = Arc::new(hub.member());
            let f = f.clone();
            thread::spawn(move || {
                let launch = LaunchEnv::Distributed(LaunchSignals {
                    rank,
                    local_rank: rank,
                    world_size,
                    master_addr: "127.0.0.1".to_owned(),
                    master_port: 29500,
                });
                let ctx = Bootstrapper::new(launch, DeviceRequest::Cpu)
                    .with_probe(FixedProbe(0))
                    .with_collective(member)
                    .initialize()
                    .unwrap();
                f(ctx)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}
