// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use crate::install_info::KeyboardLayout;
use anyhow::Context;
use std::fs;

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    let dir = ctx.target.join("etc/X11/xorg.conf.d");
    fs::create_dir_all(&dir).context("unable to create xorg.conf.d")?;

    fs::write(
        dir.join("00-keyboard.conf"),
        keyboard_stanza(&ctx.info.keyboard),
    )
    .context("unable to write the keyboard configuration")?;

    Ok(())
}

/// The X11 input-class stanza mapping every keyboard to the chosen layout.
pub fn keyboard_stanza(keyboard: &KeyboardLayout) -> String {
    let mut stanza = String::from("Section \"InputClass\"\n");
    stanza.push_str("\tIdentifier \"system-keyboard\"\n");
    stanza.push_str("\tMatchIsKeyboard \"on\"\n");
    stanza.push_str(&format!("\tOption \"XkbModel\" \"{}\"\n", keyboard.model));
    stanza.push_str(&format!("\tOption \"XkbLayout\" \"{}\"\n", keyboard.layout));
    if let Some(variant) = &keyboard.variant {
        stanza.push_str(&format!("\tOption \"XkbVariant\" \"{}\"\n", variant));
    }
    stanza.push_str("EndSection\n");
    stanza
}
