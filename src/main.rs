use anyhow::{Context, Result};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use traybridge::{BridgeConfig, MenuItem, NativeTray, TrayIcon, TrayOptions, TrayUpdate};

const ICON_SIZE: u32 = 64;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();
}

#[cfg(not(target_os = "macos"))]
#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    run().await
}

// AppKit must own the main thread; the demo itself runs on the host thread.
#[cfg(target_os = "macos")]
fn main() -> Result<()> {
    init_logging();
    traybridge::tray::platform::run_main_loop(|| {
        let result = tokio::runtime::Runtime::new()
            .context("Failed to build tokio runtime")
            .and_then(|runtime| runtime.block_on(run()));
        if let Err(e) = result {
            log::error!("{:#}", e);
        }
    })?;
    Ok(())
}

async fn run() -> Result<()> {
    log::info!("Starting traybridge demo...");

    let config = BridgeConfig::load()?;
    let icon = match std::env::args().nth(1) {
        Some(path) => TrayIcon::from_path(path),
        None => TrayIcon::from_bytes(demo_icon()?),
    };

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let tray = Arc::new(NativeTray::new(&config)?);

    let clicks = Arc::new(AtomicUsize::new(0));
    let options = TrayOptions::new(icon).with_tooltip("traybridge").on_primary_click(|| {
        log::info!("Tray icon clicked");
    });
    tray.start(options, demo_menu(Arc::downgrade(&tray), clicks, shutdown_tx))?;

    log::info!("Tray started on the {} backend", tray.family());

    let started = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, exiting...");
                break;
            }
            _ = shutdown_rx.recv() => {
                log::info!("Quit selected, exiting...");
                break;
            }
            _ = heartbeat.tick() => {
                let minutes = started.elapsed().as_secs() / 60;
                let tooltip = format!("traybridge - up {} min", minutes);
                if let Err(e) = tray.update(TrayUpdate::new().with_tooltip(tooltip)) {
                    log::warn!("Failed to refresh tooltip: {}", e);
                }
            }
        }
    }

    tray.dispose()?;
    Ok(())
}

fn demo_menu(tray: Weak<NativeTray>, clicks: Arc<AtomicUsize>, shutdown_tx: broadcast::Sender<()>) -> Vec<MenuItem> {
    let notifications = Arc::new(AtomicBool::new(true));

    let counter = {
        let tray = tray.clone();
        MenuItem::action("Click me").on_click(move || {
            let n = clicks.fetch_add(1, Ordering::SeqCst) + 1;
            let Some(tray) = tray.upgrade() else { return };
            if let Err(e) = tray.update(TrayUpdate::new().with_tooltip(format!("Clicked {} times", n))) {
                log::warn!("Failed to update tooltip: {}", e);
            }
        })
    };

    let toggle = MenuItem::checkable("Notifications", true).on_click(move || {
        let enabled = !notifications.fetch_xor(true, Ordering::SeqCst);
        let Some(tray) = tray.upgrade() else { return };
        if let Err(e) = tray.update_item_checked("Notifications", enabled) {
            log::warn!("Failed to toggle notifications: {}", e);
        }
    });

    let quit = MenuItem::action("Quit").on_click(move || {
        let _ = shutdown_tx.send(());
    });

    vec![
        counter,
        MenuItem::separator(),
        toggle,
        MenuItem::submenu(
            "More",
            vec![
                MenuItem::action("About").on_click(|| log::info!("traybridge {}", env!("CARGO_PKG_VERSION"))),
                quit,
            ],
        ),
    ]
}

/// Orange dot on a transparent square, encoded as PNG.
fn demo_icon() -> Result<Vec<u8>> {
    let radius = (ICON_SIZE / 2 - 4) as i32;
    let center = (ICON_SIZE / 2) as i32;

    let image = RgbaImage::from_fn(ICON_SIZE, ICON_SIZE, |x, y| {
        let dx = x as i32 - center;
        let dy = y as i32 - center;
        if dx * dx + dy * dy <= radius * radius {
            image::Rgba([230, 150, 0, 255])
        } else {
            image::Rgba([0, 0, 0, 0])
        }
    });

    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, ImageFormat::Png)
        .context("Failed to encode demo icon")?;
    Ok(png.into_inner())
}
