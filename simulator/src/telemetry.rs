use chrono::Utc;
use factory_monitor::plant::Vocabularies;
use factory_monitor::{Category, TelemetryFrame, TelemetryPoint};
use rand::Rng;

/// Random latest-telemetry frame covering every key of the category.
pub fn generate_frame(rng: &mut impl Rng, category: Category, keys: &Vocabularies) -> TelemetryFrame {
    let ts = Utc::now().timestamp_millis();
    let mut frame = TelemetryFrame::new();
    for key in keys.keys_for(category) {
        let value = sample(rng, key);
        frame.insert(
            key.clone(),
            vec![TelemetryPoint {
                ts,
                value: format!("{:.2}", value),
            }],
        );
    }
    frame
}

fn sample(rng: &mut impl Rng, key: &str) -> f64 {
    // 5% outliers on the readings a dashboard would alarm on
    let outlier = rng.gen_bool(0.05);

    match key {
        "voltage" if outlier => rng.gen_range(180.0..260.0),
        "voltage" => rng.gen_range(225.0..235.0),
        "current" => rng.gen_range(2.0..15.0),
        "frequency" => rng.gen_range(49.8..50.2),
        "power_factor" => rng.gen_range(0.80..0.99),
        "active_power" => rng.gen_range(500.0..5000.0),
        "total_energy" => rng.gen_range(1_000.0..100_000.0),
        "energy_cost" => rng.gen_range(0.0..500.0),
        k if k.starts_with("accel_") => rng.gen_range(-2.0..2.0),
        k if k.starts_with("velocity_") && outlier => rng.gen_range(10.0..25.0),
        k if k.starts_with("velocity_") => rng.gen_range(0.5..7.0),
        "vib_temp" => rng.gen_range(25.0..60.0),
        "cpu_temp" => rng.gen_range(35.0..80.0),
        "disk_total_gb" => 512.0,
        "disk_used_gb" => rng.gen_range(100.0..400.0),
        "ram_total_mb" => 8192.0,
        "ram_used_mb" => rng.gen_range(1_000.0..7_000.0),
        _ => rng.gen_range(0.0..100.0),
    }
}
