//! Conflict review: listing conflicts and collecting a choice for each.

use anyhow::{Context, Result};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Select;

use mapsync_core::conflict::{ChoiceKind, Conflict};
use mapsync_core::models::ErrorReport;
use mapsync_core::EntityId;

use crate::style;

/// Non-interactive resolution for every conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolveMode {
    /// Keep the local version.
    KeepLocal,
    /// Accept the remote version.
    KeepRemote,
    /// Use each conflict's pre-selected choice.
    Default,
}

impl ResolveMode {
    fn index(self, conflict: &Conflict) -> usize {
        match self {
            Self::KeepLocal => ChoiceKind::KeepLocal.index(),
            Self::KeepRemote => ChoiceKind::KeepRemote.index(),
            Self::Default => conflict.chosen,
        }
    }
}

/// Print the conflict list as a table.
pub fn print_conflicts(conflicts: &[Conflict]) {
    println!();
    println!(
        "{}",
        style::header(&format!("Conflicts ({})", conflicts.len()))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Name", "Details", "Default"]);

    for c in conflicts {
        table.add_row(vec![
            Cell::new(c.id.as_str()),
            Cell::new(&c.name),
            Cell::new(c.details.join("\n")),
            Cell::new(&c.chosen_choice().label),
        ]);
    }

    println!("{}", table);
    println!();
}

/// Print the error list of a failed attempt.
pub fn print_errors(errors: &[ErrorReport]) {
    println!();
    for e in errors {
        println!("{}", style::error(&e.message));
        for detail in &e.details {
            println!("    {}", style::dim(detail));
        }
    }
    println!();
}

/// Pick a choice for every conflict.
///
/// Returns `None` when the user cancels the save.
pub fn choose(conflicts: &[Conflict], mode: Option<ResolveMode>) -> Result<Option<Vec<(EntityId, usize)>>> {
    if let Some(mode) = mode {
        return Ok(Some(
            conflicts
                .iter()
                .map(|c| (c.id.clone(), mode.index(c)))
                .collect(),
        ));
    }

    let mut picks = Vec::with_capacity(conflicts.len());
    for c in conflicts {
        let mut items: Vec<&str> = c.choices.iter().map(|choice| choice.label.as_str()).collect();
        items.push("Cancel save");

        let pick = Select::new()
            .with_prompt(format!("{} ({})", c.name, c.id))
            .items(&items)
            .default(c.chosen)
            .interact()
            .context("failed to read conflict choice")?;

        if pick >= c.choices.len() {
            return Ok(None);
        }
        picks.push((c.id.clone(), pick));
    }
    Ok(Some(picks))
}
