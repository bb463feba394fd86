//! Refit demo application
//!
//! Renders a plane and two spinning triangles on the headless backend.
//! Every frame refits that frame's top-level acceleration structure, traces
//! the scene, scales it onto the back buffer and presents.
//!
//! ```text
//! refit_app [--frames N] [--config PATH] [--save-config PATH]
//!           [--lose-device-at FRAME] [--cycle-resolution EVERY]
//! ```

mod scene;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rt_engine::config::{Config, ConfigError};
use rt_engine::render::api::{DeviceConfig, GraphicsError, Rect};
use rt_engine::render::backends::headless::{HeadlessBackend, HeadlessControl, HeadlessSurface};
use rt_engine::render::device::{DeviceNotify, SwapchainManager};

use scene::RefitScene;

const WINDOW_WIDTH: u32 = 1280;
const WINDOW_HEIGHT: u32 = 720;
const DEFAULT_CONFIG_PATH: &str = "refit_app.toml";

/// Demo failures
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("{0}")]
    Usage(String),

    #[error("graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Command line options
#[derive(Debug, Clone, PartialEq)]
struct Options {
    frames: u32,
    config_path: String,
    save_config: Option<String>,
    lose_device_at: Option<u32>,
    cycle_resolution_every: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frames: 240,
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            save_config: None,
            lose_device_at: None,
            cycle_resolution_every: None,
        }
    }
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, AppError> {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = || args.next().ok_or_else(|| AppError::Usage(format!("{} needs a value", arg)));
            match arg.as_str() {
                "--frames" => options.frames = parse_number(&value()?)?,
                "--config" => options.config_path = value()?,
                "--save-config" => options.save_config = Some(value()?),
                "--lose-device-at" => options.lose_device_at = Some(parse_number(&value()?)?),
                "--cycle-resolution" => options.cycle_resolution_every = Some(parse_number(&value()?)?.max(1)),
                _ => return Err(AppError::Usage(format!("unknown argument '{}'", arg))),
            }
        }
        Ok(options)
    }
}

fn parse_number(value: &str) -> Result<u32, AppError> {
    value.parse().map_err(|_| AppError::Usage(format!("'{}' is not a number", value)))
}

/// Flags the scene for recreation after the device was replaced
struct SceneInvalidator {
    lost: Arc<AtomicBool>,
}

impl DeviceNotify for SceneInvalidator {
    fn on_device_lost(&mut self) {
        log::warn!("Device lost, dropping scene resources");
        self.lost.store(true, Ordering::SeqCst);
    }

    fn on_device_restored(&mut self) {
        log::info!("Device restored, scene will be rebuilt");
    }
}

struct RefitApp {
    options: Options,
    control: HeadlessControl,
    manager: SwapchainManager,
    scene: Option<RefitScene>,
    scene_lost: Arc<AtomicBool>,
}

impl RefitApp {
    fn new(options: Options) -> Result<Self, AppError> {
        let config = DeviceConfig::load_or_default(&options.config_path)?;
        if let Some(path) = &options.save_config {
            config.save_to_file(path)?;
            log::info!("Saved device configuration to {}", path);
        }

        let backend = HeadlessBackend::default();
        let control = backend.control();
        let surface = HeadlessSurface::new(Rect::from_size(WINDOW_WIDTH, WINDOW_HEIGHT));

        let mut manager = SwapchainManager::new(Box::new(backend), config)?;
        manager.set_window(Box::new(surface), WINDOW_WIDTH, WINDOW_HEIGHT);

        let scene_lost = Arc::new(AtomicBool::new(false));
        manager.register_device_notify(Box::new(SceneInvalidator { lost: Arc::clone(&scene_lost) }));

        manager.create_device_resources()?;
        manager.create_window_size_dependent_resources()?;

        Ok(Self { options, control, manager, scene: None, scene_lost })
    }

    fn run(&mut self) -> Result<(), AppError> {
        let mut scene = RefitScene::new(&mut self.manager)?;
        let start = Instant::now();

        for frame in 0..self.options.frames {
            if self.options.lose_device_at == Some(frame) {
                log::info!("Injecting device removal before frame {}", frame);
                self.control.inject_device_removed("injected by --lose-device-at");
            }
            if let Some(every) = self.options.cycle_resolution_every {
                if frame > 0 && frame % every == 0 {
                    let resolution = self.manager.increase_resolution_index()?;
                    log::info!("Scene resolution {}x{}", resolution.width, resolution.height);
                }
            }

            scene.render(&mut self.manager, frame as f32 * 0.02)?;
            self.manager.present()?;

            if self.scene_lost.swap(false, Ordering::SeqCst) {
                scene.release(&self.manager);
                scene = RefitScene::new(&mut self.manager)?;
            }
        }
        self.manager.wait_for_gpu()?;
        self.scene = Some(scene);

        let elapsed = start.elapsed();
        let stats = self.control.stats();
        log::info!(
            "{} frames in {:.2?}: {} refits, {} dispatches, device generation {}",
            stats.presents,
            elapsed,
            stats.acceleration_structure_refits,
            stats.dispatches,
            self.manager.device_generation()
        );

        let errors = self.control.validation_errors();
        for error in &errors {
            log::error!("Validation: {}", error);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Usage(format!("{} validation errors", errors.len())))
        }
    }

    fn cleanup(&mut self) {
        if let Some(scene) = self.scene.take() {
            scene.release(&self.manager);
        }
        if let Err(err) = self.manager.wait_for_gpu() {
            log::warn!("Failed to drain the GPU on shutdown: {}", err);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).init();

    log::info!("Starting refit demo");
    let options = Options::parse(std::env::args().skip(1))?;
    let mut app = RefitApp::new(options)?;

    let result = app.run();
    app.cleanup();
    match result {
        Ok(()) => {
            log::info!("Refit demo completed successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Refit demo failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_options() {
        let options =
            Options::parse(args(&["--frames", "10", "--lose-device-at", "4", "--cycle-resolution", "3"])).unwrap();
        assert_eq!(options.frames, 10);
        assert_eq!(options.lose_device_at, Some(4));
        assert_eq!(options.cycle_resolution_every, Some(3));
        assert_eq!(options.config_path, DEFAULT_CONFIG_PATH);

        assert!(Options::parse(args(&["--frames"])).is_err());
        assert!(Options::parse(args(&["--frames", "many"])).is_err());
        assert!(Options::parse(args(&["--fullscreen"])).is_err());
    }

    /// The whole loop, including a device loss and resolution changes, runs clean
    #[test]
    fn test_demo_loop() {
        let options = Options {
            frames: 12,
            config_path: "missing-refit-config.toml".to_string(),
            lose_device_at: Some(5),
            cycle_resolution_every: Some(4),
            ..Options::default()
        };
        let mut app = RefitApp::new(options).unwrap();
        app.run().unwrap();
        assert_eq!(app.manager.device_generation(), 1);

        let stats = app.control.stats();
        // the present of the frame that lost the device never reaches the display
        assert_eq!(stats.presents, 11);
        // the removal discards up to one frame of queued work per back buffer
        let in_flight = u64::from(DeviceConfig::default().back_buffer_count);
        assert!(stats.dispatches >= 12 - in_flight, "{:?}", stats);
        assert!(stats.dispatches < 12, "{:?}", stats);
        assert!(app.control.validation_errors().is_empty());
        app.cleanup();
    }
}
