//! Power curve over a participant × item grid.
//!
//! This example shows how to:
//! 1. Describe the assumed data-generating model
//! 2. Sweep a grid of sample sizes
//! 3. Pick the smallest size reaching a target power
//! 4. Export the power table as TSV

use composable_power::prelude::*;

fn main() -> Result<()> {
    println!("=== Composable Power: Power Curve ===\n");

    let model = GenerativeModel::new(
        800.0,
        [("Verb", -20.0), ("Noun", 30.0), ("Adj", 10.0), ("Adv", -10.0)],
        100.0,
        80.0,
        200.0,
    )?;

    println!("Model:");
    println!("  Levels: {}", model.levels().join(", "));
    println!(
        "  SDs (participant / item / residual): {} / {} / {}",
        model.sd_participant, model.sd_item, model.sd_residual
    );
    println!();

    let target = 0.8;
    let sweep = ConfigurationSweep::new(
        PowerEstimator::default().with_seed(2024),
        model,
        200,
        0.05,
    )?;
    let grid = configuration_grid(&[6, 10, 14, 20], &[6, 10, 14, 20]);

    println!("=== Grid Sweep ({} configurations) ===\n", grid.len());
    let table = sweep.sweep_grid(&grid)?;

    println!("{:>12} {:>6} {:>8} {:>8}", "participants", "items", "power", "se");
    for result in table.iter() {
        println!(
            "{:>12} {:>6} {:>8.3} {:>8.3}",
            result.participants,
            result.items,
            result.power,
            result.mc_standard_error()
        );
    }
    println!();

    println!("=== Smallest Design ===\n");
    match table.smallest_meeting(target) {
        Some(best) => println!(
            "{} participants × {} items reach power {:.3} (target {})",
            best.participants, best.items, best.power, target
        ),
        None => println!(
            "No configuration reached {} (best {:.3})",
            target,
            table.best_power().unwrap_or(0.0)
        ),
    }
    println!();

    let path = "power_curve.tsv";
    table.to_tsv(path)?;
    println!("Power table written to {}", path);

    Ok(())
}
