use anyhow::{Context, Result};
use colored::*;
use coinstac_core::domain::run::RunMode;
use coinstac_pipeline::{ContainerDriver, PodmanDriver};
use std::path::Path;

use super::load_spec;
use crate::config::Config;

pub async fn handle_pull(path: &Path, config: &Config) -> Result<()> {
    let spec = load_spec(path)?;

    let mut images = spec.images_for(RunMode::Local);
    for image in spec.images_for(RunMode::Remote) {
        if !images.contains(&image) {
            images.push(image);
        }
    }
    if images.is_empty() {
        println!("{}", "No images to pull.".yellow());
        return Ok(());
    }

    let driver = PodmanDriver::new(&config.container_binary);
    let version = driver
        .check_available()
        .await
        .context("Container runtime is not available")?;
    println!("Using {}", version.dimmed());

    for image in &images {
        println!("  {} {}", "▸".cyan(), image);
    }
    driver
        .pull_images(&images)
        .await
        .context("Failed to pull images")?;

    println!(
        "{}",
        format!("✓ Pulled {} image(s)", images.len()).green().bold()
    );
    Ok(())
}
