//! Shared UI icons and emojis.
//!
//! Each icon has a plain-text fallback for terminals without emoji support.

use console::Emoji;
use fixwatch_common::ActivityKind;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[..]");

// Activity kinds
pub static TOOL: Emoji<'_, '_> = Emoji("🔧 ", "[tool]");
pub static MESSAGE: Emoji<'_, '_> = Emoji("💬 ", "[msg]");
pub static RESULT: Emoji<'_, '_> = Emoji("🏁 ", "[result]");
pub static ERROR: Emoji<'_, '_> = Emoji("🚨 ", "[error]");
pub static PUSH: Emoji<'_, '_> = Emoji("⬆️  ", "[push]");
pub static CI: Emoji<'_, '_> = Emoji("🔁 ", "[ci]");

// Connection and progress
pub static PLUG: Emoji<'_, '_> = Emoji("🔌 ", "[conn]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

pub fn activity_icon(kind: ActivityKind) -> &'static Emoji<'static, 'static> {
    match kind {
        ActivityKind::Tool => &TOOL,
        ActivityKind::Message => &MESSAGE,
        ActivityKind::Result => &RESULT,
        ActivityKind::Error => &ERROR,
        ActivityKind::Push => &PUSH,
        ActivityKind::Ci => &CI,
    }
}
