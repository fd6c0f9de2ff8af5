use terrain_core::{
    DiamondSquareCpu, DiamondSquareParallel, DiamondSquareParams, NoiseGenerator,
    ParallelBackend, PoolConfig, SeedMap, WorkUnit, WorkerPool,
};

fn main() -> terrain_core::Result<()> {
    env_logger::init();

    // 129×129 map from four corner seeds, seed 2025
    let params = DiamondSquareParams::new(129, 2025, 1.0, 0.55);
    let seeds = SeedMap::corners(0.2, 0.7, 0.5, 0.9)?;

    // Try the parallel-grid engine first, fall back to the worker pool
    let map = match ParallelBackend::acquire(0) {
        Ok(backend) => {
            let mut ds = DiamondSquareParallel::new(params)?;
            ds.set_seed_heights(seeds)?;
            ds.generate(Some(&backend))?;
            println!(
                "parallel grid: {0}x{0} on {1} threads",
                ds.params().dimension,
                backend.threads()
            );
            ds.height_map()
        }
        Err(err) => {
            eprintln!("parallel backend unavailable ({err}), using worker pool");
            let pool = WorkerPool::<WorkUnit>::from_config(&PoolConfig::default())?;
            let mut ds = DiamondSquareCpu::new(params)?;
            ds.set_seed_heights(seeds)?;
            ds.generate(Some(&pool))?;
            println!(
                "worker pool: {0}x{0} on {1} workers",
                ds.params().dimension,
                pool.worker_count()
            );
            println!("sampled centre: {:.3}", ds.sample(0.5, 0.5));
            ds.height_map()
        }
    };

    // Print the top-left 16×16 corner of the map
    if let Some(map) = map {
        for row in map.iter().take(16) {
            for v in row.iter().take(16) {
                print!("{:>6.3} ", v);
            }
            println!();
        }
    }
    Ok(())
}
