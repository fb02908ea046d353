use std::sync::OnceLock;
use crate::node::Node;
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

static QUIET: OnceLock<bool> = OnceLock::new();

/// `NODESTORE_QUIET=1` suppresses decorative output
pub fn is_quiet() -> bool {
    *QUIET.get_or_init(|| {
        std::env::var("NODESTORE_QUIET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

pub fn header(text: &str) {
    if is_quiet() {
        return;
    }
    println!("{} {}", Icons::ROCKET, text.style(theme().header.clone()));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, label.style(theme().label.clone()), value);
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().clean.clone()));
}




pub fn section(title: &str) {
    if is_quiet() {
        return;
    }
    println!();
    println!("━{}━", title.style(theme().header.clone()));
}


pub fn muted(text: &str) -> String {
    text.style(theme().muted.clone()).to_string()
}

/// One line per node: key, state and version
pub fn node_line(node: &Node) {
    let state = node.state();
    println!(
        "{} {} {} {}",
        Icons::NODE.style(theme().key.clone()),
        node.key().to_string().style(theme().key.clone()),
        state.as_str().style(theme().state(state)),
        muted(&format!("v{}", node.version()))
    );
}

pub fn node_new(key: &str) {
    println!("{} {}", Icons::NEW.style(theme().new.clone()), key);
}

pub fn node_modified(key: &str) {
    println!("{} {}", Icons::MOD.style(theme().dirty.clone()), key);
}

pub fn node_deleted(key: &str) {
    println!("{} {}", Icons::DEL.style(theme().tombstoned.clone()), key);
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().label.clone()), value);
}
