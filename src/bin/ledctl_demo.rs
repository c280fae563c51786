//! Minimal demo binary: wires a `Container` around a couple of hard-coded
//! zones and simulated strips, to exercise the crate end-to-end. Real
//! config loading, transport framing and GPIO drivers are out of scope
//! (spec §1) and intentionally not implemented here.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ledctl_core::animation::AnimationFactory;
use ledctl_core::color::{Color, ColorPresetConfig, PresetCategory};
use ledctl_core::config::{StaticConfig, SystemConfig, ZoneConfig};
use ledctl_core::event::ShutdownReason;
use ledctl_core::strip_driver::SimulatedStrip;
use ledctl_core::Container;

#[derive(Parser, Debug)]
#[command(name = "ledctl-demo", about = "Runs the LED controller core against simulated strips")]
struct Args {
    /// Path to the snapshot file to read/write.
    #[arg(long, default_value = "ledctl-demo-snapshot.json")]
    snapshot_path: std::path::PathBuf,

    /// Target render rate in frames per second.
    #[arg(long, default_value_t = 60)]
    fps: u32,
}

fn demo_config(fps: u32) -> Arc<StaticConfig> {
    Arc::new(StaticConfig {
        zones: vec![
            ZoneConfig {
                id: "living_room".into(),
                display_name: "Living Room".into(),
                pixel_count: 60,
                gpio_pin: 18,
                strip: "strip_a".into(),
                pixel_index_range: 0..60,
                layout: Some("linear".into()),
            },
            ZoneConfig {
                id: "kitchen".into(),
                display_name: "Kitchen".into(),
                pixel_count: 30,
                gpio_pin: 18,
                strip: "strip_a".into(),
                pixel_index_range: 60..90,
                layout: Some("linear".into()),
            },
        ],
        presets: vec![ColorPresetConfig {
            name: "warm_white".into(),
            rgb: (255, 180, 100),
            category: PresetCategory::Warm,
        }],
        animations: vec![],
        system: SystemConfig {
            fps_target: fps,
            ..SystemConfig::default()
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = demo_config(args.fps);

    let make_animation: AnimationFactory = Arc::new(|_id| None);
    let container = Container::new(config, &args.snapshot_path, make_animation)?;
    container.register_strip("strip_a".into(), || SimulatedStrip::new("strip_a"));
    container.spawn_render_task();

    container
        .zones
        .set_color(&"living_room".into(), Color::rgb(0, 120, 255), None, ledctl_core::event::SourceType::Internal)
        .ok();

    tracing::info!("ledctl-demo running; Ctrl-C to shut down");

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Signal,
        reason = container.wait_for_shutdown_reason() => reason,
    };

    tracing::info!(%reason, "shutting down");
    let outcomes = container.shutdown(reason).await;
    let exit_code = if outcomes.iter().all(|o| o.ok) { 0 } else { 1 };
    std::process::exit(exit_code);
}
