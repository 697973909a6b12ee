use std::path::PathBuf;

use anyhow::{Context, Result};

use rust_lidar_mapping::config::{SlamParameters, load_parameters};
use rust_lidar_mapping::io::{list_scan_files, load_scan};
use rust_lidar_mapping::optimizer::SolveOutcome;
use rust_lidar_mapping::system::SlamSystem;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let scan_dir = args.next().unwrap_or_else(|| "data/scans".to_string());
    let config_path = args.next();
    let output_dir = PathBuf::from(args.next().unwrap_or_else(|| "output".to_string()));

    let params = match &config_path {
        Some(path) => load_parameters(path).with_context(|| format!("Failed to load parameters from {}", path))?,
        None => SlamParameters::default(),
    };

    println!("Loading scans from: {}", scan_dir);
    let scans = list_scan_files(&scan_dir)?;
    println!("Found {} scans", scans.len());

    let mut slam_system = SlamSystem::new(params)?;

    let mut odometry_failures = 0;
    let mut rejected = 0;
    for (i, scan_file) in scans.iter().enumerate() {
        let cloud = load_scan(&scan_file.path)?;
        let outcome = slam_system.add_range_scan(&cloud, scan_file.time);

        if !outcome.odometry.is_success() {
            odometry_failures += 1;
        } else if !outcome.is_success() {
            rejected += 1;
        }

        if i % 100 == 0 {
            let position = slam_system
                .get_map_to_range_sensor(scan_file.time)
                .map(|pose| pose.translation)
                .ok();
            println!(
                "Scan {}/{} (t={}): {} points, {} submaps, position={:?}",
                i,
                scans.len(),
                scan_file.time,
                cloud.len(),
                slam_system.submaps().num_submaps(),
                position.map(|p| [p.x, p.y, p.z])
            );
        }
    }

    // Stop the workers and flush the last finished submap through the optimizer
    let final_solve = slam_system.finish()?;
    match &final_solve {
        SolveOutcome::Solved(summary) => println!(
            "Final optimization: {} nodes, {} edges ({} loop closures), error {:.6} -> {:.6}",
            summary.num_nodes, summary.num_edges, summary.num_loop_closures, summary.initial_error, summary.final_error
        ),
        SolveOutcome::Skipped => println!("Final optimization skipped, graph already up to date"),
    }

    std::fs::create_dir_all(&output_dir).with_context(|| format!("Failed to create {}", output_dir.display()))?;
    slam_system.dump_to_file(output_dir.join("pose_graph.csv"))?;
    let num_submaps = slam_system.save_submaps(output_dir.join("submaps"))?;
    let num_points = slam_system.save_map(output_dir.join("map.csv"))?;

    println!(
        "Done! Processed {} scans ({} odometry failures, {} rejected), {} submaps, {} map points written to {}",
        scans.len(),
        odometry_failures,
        rejected,
        num_submaps,
        num_points,
        output_dir.display()
    );

    Ok(())
}
