//! Perch Desktop: application entry.

mod app;

use eframe::egui;

fn main() -> eframe::Result<()> {
    app::install_logger();

    // Fail before opening a window when config is unreadable or no API key is set.
    let (runtime, orchestrator) = match app::start_orchestrator() {
        Ok(started) => started,
        Err(e) => {
            log::error!("startup failed: {:#}", e);
            eprintln!("perch-desktop: {:#}", e);
            std::process::exit(1);
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([480.0, 640.0])
            .with_min_inner_size([360.0, 420.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Perch",
        options,
        Box::new(move |_cc| Box::new(app::PerchApp::new(runtime, orchestrator))),
    )
}
