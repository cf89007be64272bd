#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")] // hide console window on Windows in release
#![allow(rustdoc::missing_crate_level_docs)] // it's a demo

use eframe::egui;
use egui_inspection_map::{
    MapView,
    config::{DatasetEndpoints, OpenStreetMapConfig},
    export::{ExportFormat, ExportOptions},
    tools::ToolState,
};

fn main() -> eframe::Result {
    env_logger::init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 700.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Inspection map viewer",
        options,
        Box::new(|_cc| Ok(Box::<MyApp>::default())),
    )
}

struct MyApp {
    map: MapView,
}

impl Default for MyApp {
    fn default() -> Self {
        // Point the endpoints at your inspection API; the token normally
        // comes from the host application's auth layer.
        let endpoints = DatasetEndpoints::new(
            "https://inspections.example.org/api/v1",
            std::env::var("INSPECTION_API_TOKEN").unwrap_or_default(),
        );
        Self {
            map: MapView::new(OpenStreetMapConfig::default(), endpoints),
        }
    }
}

impl eframe::App for MyApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::SidePanel::left("controls").show(ctx, |ui| {
            ui.heading("Layers");
            let toggles: Vec<(String, String, usize, bool)> = self
                .map
                .registry
                .layers()
                .map(|layer| {
                    (
                        layer.id.clone(),
                        layer.display_name.clone(),
                        layer.feature_count,
                        layer.visible,
                    )
                })
                .collect();
            for (id, name, count, mut visible) in toggles {
                if ui.checkbox(&mut visible, format!("{name} ({count})")).changed() {
                    self.map.registry.toggle_layer(&id);
                }
            }

            ui.separator();
            ui.heading("Tools");
            match self.map.tools.state() {
                ToolState::Idle => {
                    if ui.button("Measure distance").clicked() {
                        self.map.tools.start_measuring();
                    }
                    if ui.button("Draw polygon").clicked() {
                        self.map.tools.start_drawing();
                    }
                }
                ToolState::Measuring { .. } => {
                    if ui.button("Finish measurement").clicked() {
                        self.map.tools.stop_measuring();
                    }
                }
                ToolState::Drawing { .. } => {
                    if ui.button("Finish polygon").clicked() {
                        self.map.tools.stop_drawing();
                    }
                }
            }
            if ui.button("Clear tools").clicked() {
                self.map.tools.clear();
            }

            ui.separator();
            ui.heading("Results");
            let mut remove_measurement = None;
            for measurement in self.map.tools.measurements() {
                ui.horizontal(|ui| {
                    ui.label(&measurement.formatted_value);
                    if ui.small_button("✖").clicked() {
                        remove_measurement = Some(measurement.id);
                    }
                });
            }
            if let Some(id) = remove_measurement {
                self.map.tools.remove_measurement(id);
            }

            let mut remove_drawing = None;
            for drawing in self.map.tools.drawings() {
                ui.horizontal(|ui| {
                    ui.label(&drawing.formatted_area);
                    if ui.small_button("✖").clicked() {
                        remove_drawing = Some(drawing.id);
                    }
                });
            }
            if let Some(id) = remove_drawing {
                self.map.tools.remove_drawing(id);
            }

            ui.separator();
            if ui.button("Export PNG").clicked() {
                self.map.request_export(ExportOptions {
                    format: ExportFormat::Png,
                    quality: 90,
                    filename: "inspection-map".to_string(),
                });
            }
            if let Some(result) = self.map.last_export() {
                match result {
                    Ok(path) => ui.label(format!("Saved {}", path.display())),
                    Err(message) => ui.colored_label(egui::Color32::RED, message),
                };
            }

            if let Some(mouse_pos) = self.map.mouse_pos {
                ui.separator();
                ui.label(format!("{:.5}, {:.5}", mouse_pos.lat, mouse_pos.lon));
            }
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::NONE)
            .show(ctx, |ui| {
                ui.add(&mut self.map);
            });
    }
}
