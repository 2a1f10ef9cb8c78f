// SPDX-License-Identifier: GPL-3.0-only

use super::StepContext;
use anyhow::Context;
use std::fs;

pub fn apply(ctx: &mut StepContext) -> anyhow::Result<()> {
    let lang = normalize_locale(&ctx.info.locale);

    fs::write(
        ctx.target.join("etc/locale.conf"),
        format!("LANG={}\n", lang),
    )
    .context("unable to write /etc/locale.conf")?;

    Ok(())
}

/// Force a locale tag onto its UTF-8 variant. Tags already carrying a
/// UTF-8 codeset pass through unchanged, modifiers included.
pub fn normalize_locale(tag: &str) -> String {
    let (base, modifier) = match tag.find('@') {
        Some(at) => (&tag[..at], &tag[at..]),
        None => (tag, ""),
    };

    let codeset = base.find('.').map(|dot| &base[dot + 1..]);
    match codeset {
        Some(codeset) if codeset.eq_ignore_ascii_case("UTF-8") => tag.to_owned(),
        Some(_) | None => {
            let language = base.split('.').next().unwrap_or(base);
            format!("{}.UTF-8{}", language, modifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_tags_pass_through() {
        assert_eq!(normalize_locale("en_US.UTF-8"), "en_US.UTF-8");
        assert_eq!(normalize_locale("de_DE.utf-8"), "de_DE.utf-8");
    }

    #[test]
    fn legacy_codesets_are_rewritten() {
        assert_eq!(normalize_locale("en_US.ISO-8859-1"), "en_US.UTF-8");
        assert_eq!(normalize_locale("ja_JP.EUC-JP"), "ja_JP.UTF-8");
    }

    #[test]
    fn bare_tags_gain_a_codeset() {
        assert_eq!(normalize_locale("fr_FR"), "fr_FR.UTF-8");
    }

    #[test]
    fn modifiers_survive_normalization() {
        assert_eq!(normalize_locale("sr_RS@latin"), "sr_RS.UTF-8@latin");
        assert_eq!(normalize_locale("ca_ES.ISO-8859-15@euro"), "ca_ES.UTF-8@euro");
    }
}
