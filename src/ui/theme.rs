use owo_colors::Style;
use std::sync::OnceLock;
use crate::node::NodeState;

static THEME: OnceLock<Theme> = OnceLock::new();

/// Terminal styles, one per node state plus the chrome around them
#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub label: Style,
    pub muted: Style,
    pub key: Style,
    pub clean: Style,
    pub new: Style,
    pub dirty: Style,
    pub tombstoned: Style,
}

impl Theme {
    pub fn detect() -> Self {
        if !console::Term::stdout().is_term() {
            return Self::plain();
        }
        Self::colored()
    }

    pub fn colored() -> Self {
        Self {
            header: Style::new().cyan().bold(),
            label: Style::new().white().dimmed(),
            muted: Style::new().bright_black(),
            key: Style::new().blue().bold(),
            clean: Style::new().green().bold(),
            new: Style::new().magenta().bold(),
            dirty: Style::new().yellow().bold(),
            tombstoned: Style::new().red().bold(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            label: Style::new(),
            muted: Style::new(),
            key: Style::new(),
            clean: Style::new(),
            new: Style::new(),
            dirty: Style::new(),
            tombstoned: Style::new(),
        }
    }

    /// Style used to print a node in `state`
    pub fn state(&self, state: NodeState) -> Style {
        match state {
            NodeState::Clean => self.clean.clone(),
            NodeState::New => self.new.clone(),
            NodeState::Dirty => self.dirty.clone(),
            NodeState::Tombstoned => self.tombstoned.clone(),
            NodeState::Transient => self.muted.clone(),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use owo_colors::OwoColorize;

    #[test]
    fn test_plain_theme_adds_no_escapes() {
        let theme = Theme::plain();
        for state in [NodeState::Transient, NodeState::New, NodeState::Clean, NodeState::Dirty, NodeState::Tombstoned] {
            assert_eq!(state.as_str().style(theme.state(state)).to_string(), state.as_str());
        }
    }

    #[test]
    fn test_states_are_told_apart() {
        let theme = Theme::colored();
        let dirty = "x".style(theme.state(NodeState::Dirty)).to_string();
        let clean = "x".style(theme.state(NodeState::Clean)).to_string();
        assert_ne!(dirty, clean);
    }
}
