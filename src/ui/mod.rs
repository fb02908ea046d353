//! Terminal output for the `nodestore` binary

pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{
    header, is_quiet, muted, node_deleted, node_line, node_modified, node_new, section, status, success,
    summary_row,
};
pub use table::{properties_table, stats_table, TableBuilder};
pub use theme::{theme, Theme};
