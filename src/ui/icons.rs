//! Shared UI icons.
//!
//! Each icon falls back to plain ASCII on terminals without emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "* ");

// Step indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>] ");
pub static DRY_RUN: Emoji<'_, '_> = Emoji("📝 ", "[dry-run] ");
pub static SKIPPED: Emoji<'_, '_> = Emoji("⏭️  ", "[skip] ");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T] ");
