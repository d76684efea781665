use std::time::Instant;

use panomerge_cli::panomerge_core::synthetic::{textured_scene, unrelated_scene};
use panomerge_cli::panomerge_core::{CancelToken, DetectorKind, MergeConfiguration, MergeMode};
use panomerge_cli::{io, MergeEngine};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🧩 Synthetic Panorama Demo");
    println!("==========================\n");

    let scene = textured_scene(960, 360, 7);
    let strip = vec![scene.crop(0, 0, 400, 360), scene.crop(280, 0, 400, 360), scene.crop(560, 0, 400, 360)];
    println!("📷 Three 400x360 crops of a 960x360 scene, 120 px overlap");

    for (detector, mode) in [
        (DetectorKind::ScaleInvariant, MergeMode::FeatureMerge),
        (DetectorKind::Binary, MergeMode::FeatureMerge),
        (DetectorKind::Binary, MergeMode::Blend),
    ] {
        let cfg = MergeConfiguration::default().with_detector(detector).with_mode(mode).with_seed(1);
        let engine = MergeEngine::new(cfg)?;

        let t0 = Instant::now();
        let out = engine.merge(strip.clone(), &CancelToken::new())?;
        let meta = &out.metadata;
        println!(
            "   • {:<15} {:<13} {}x{} inliers={} ratio={:.2} in {:.2?}",
            detector.as_str(),
            mode.as_str(),
            meta.canvas_width,
            meta.canvas_height,
            meta.inlier_count,
            meta.inlier_ratio,
            t0.elapsed()
        );

        let path = format!("panorama_{}_{}.png", detector, mode);
        io::save_png(&out.image, path.as_ref())?;
    }

    println!("\n🔀 Fallback chain with an unrelated image in the middle");
    let mixed = vec![strip[0].clone(), unrelated_scene(400, 360, 3), strip[1].clone()];
    let out = MergeEngine::new(MergeConfiguration::default().with_detector(DetectorKind::Binary))?
        .merge(mixed, &CancelToken::new())?;
    for status in &out.metadata.per_pair_status {
        println!("   • image {}: {:?} via {}", status.image_index, status.outcome, status.mode_used);
    }
    println!("   degraded: {}", out.metadata.degraded);
    println!("{}", serde_json::to_string_pretty(&out.metadata)?);
    io::save_png(&out.image, "panorama_degraded.png".as_ref())?;

    Ok(())
}
