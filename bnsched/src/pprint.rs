use crate::expr::Var;
use crate::lower::LoweredKernel;
use crate::scheduling::{Relation, Schedule, SchedulePlan};

use prettytable::{self, format, row, Cell};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PlanPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [SchedulePlan] to stdout.
pub fn pprint(plan: &SchedulePlan, style: PlanPrintStyle) {
    print!("{}", pprint_string(plan, style));
}

/// Pretty-print a [SchedulePlan] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    plan: &SchedulePlan,
    style: PlanPrintStyle,
) -> fmt::Result {
    writeln!(out, "{} {}", plan.variant(), plan.launch_grid())?;
    write!(out, "{}", plan_table(plan, style))?;
    if style == PlanPrintStyle::Full {
        let schedule = plan.schedule();
        for (i, primitive) in schedule.history().iter().enumerate() {
            writeln!(out, "{}. {}", i + 1, primitive.describe(schedule))?;
        }
    }
    Ok(())
}

pub fn pprint_string(plan: &SchedulePlan, style: PlanPrintStyle) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = pprint_write(&mut out, plan, style);
    out
}

/// Pretty-print a [LoweredKernel]'s loop nest to stdout.
pub fn pprint_lowered(kernel: &LoweredKernel) {
    lowered_table(kernel).printstd()
}

fn table_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

fn plan_table(plan: &SchedulePlan, style: PlanPrintStyle) -> prettytable::Table {
    let schedule = plan.schedule();
    let mut table = prettytable::Table::new();
    table.set_titles(match style {
        PlanPrintStyle::Full => row!["Axis", "Extent", "Binding", "Derived From"],
        PlanPrintStyle::Compact => row!["Axis", "Binding"],
    });
    for leaf in schedule.leaves() {
        let binding = leaf
            .binding
            .map(|b| b.to_string())
            .unwrap_or_else(|| "serial".to_owned());
        let mut r = row![leaf.name];
        if style == PlanPrintStyle::Full {
            r.add_cell(Cell::new(&leaf.extent.to_string()));
        }
        r.add_cell(Cell::new(&binding));
        if style == PlanPrintStyle::Full {
            r.add_cell(Cell::new(&origin(schedule, leaf.var)));
        }
        table.add_row(r);
    }
    table.set_format(table_format());
    table
}

/// Describe the relation which produced `var`, or `"root"` for output axes.
fn origin(schedule: &Schedule, var: Var) -> String {
    let name = |v: Var| {
        schedule
            .iter_var(v)
            .map(|iv| iv.name.clone())
            .unwrap_or_else(|| v.to_string())
    };
    for relation in schedule.relations() {
        match *relation {
            Relation::Split {
                parent,
                outer,
                inner,
                factor,
            } if outer == var || inner == var => {
                let part = if outer == var { "outer" } else { "inner" };
                return format!("{part} of split({}, {factor})", name(parent));
            }
            Relation::Fuse {
                outer,
                inner,
                fused,
            } if fused == var => {
                return format!("fuse({}, {})", name(outer), name(inner));
            }
            _ => {}
        }
    }
    "root".to_owned()
}

fn lowered_table(kernel: &LoweredKernel) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row![format!("{} {}", kernel.name, kernel.grid)]);
    let rendered = kernel.to_string();
    for line in rendered.lines().skip(1) {
        table.add_row(row![line]);
    }
    table.set_format(table_format());
    table
}
