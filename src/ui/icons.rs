pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const STATS: &str = "📊";
    pub const NODE: &str = "🔵";
    pub const NEW: &str = "✨";
    pub const MOD: &str = "📝";
    pub const DEL: &str = "🗑️";
    pub const DATABASE: &str = "🗄️";
    pub const GEAR: &str = "⚙️";
}
