//! Cell styling: fonts, fills, borders, number formats, alignment, and a
//! deduplicating registry that assigns each distinct style a stable id.

use std::collections::HashMap;

/// An RGB or theme-relative color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Color {
    /// 0xAARRGGBB.
    Rgb(u32),
    /// Index into the workbook theme's color slots, with an optional tint
    /// applied (`-1.0..=1.0`, darker to lighter).
    Theme { slot: u32, tint: f64 },
}

impl Eq for Color {}

impl std::hash::Hash for Color {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Color::Rgb(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Color::Theme { slot, tint } => {
                1u8.hash(state);
                slot.hash(state);
                tint.to_bits().hash(state);
            }
        }
    }
}

/// Line style for one border side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BorderLineStyle {
    #[default]
    None,
    Thin,
    Medium,
    Thick,
    Dashed,
    Dotted,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BorderSide {
    pub style: BorderLineStyle,
    pub color: Option<Color>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Border {
    pub top: BorderSide,
    pub bottom: BorderSide,
    pub left: BorderSide,
    pub right: BorderSide,
}

/// Cell background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fill {
    #[default]
    None,
    Solid(Color),
    Pattern {
        fg: Color,
        bg: Color,
        pattern_type: PatternType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternType {
    Gray125,
    DarkGray,
    LightGray,
    DarkHorizontal,
    DarkVertical,
}

/// Font attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Font {
    pub name: String,
    pub size: f64,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub color: Option<Color>,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            name: "Calibri".to_string(),
            size: 11.0,
            bold: false,
            italic: false,
            underline: false,
            color: None,
        }
    }
}

impl Eq for Font {}

impl std::hash::Hash for Font {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.to_bits().hash(state);
        self.bold.hash(state);
        self.italic.hash(state);
        self.underline.hash(state);
        self.color.hash(state);
    }
}

/// Built-in or custom number format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NumFmt {
    General,
    Integer,
    Decimal2,
    Thousands,
    ThousandsDecimal2,
    Percent,
    PercentDecimal2,
    Scientific,
    DateMdy,
    DateDmy,
    DateDm,
    DateMy,
    TimeHmAmPm,
    TimeHmsAmPm,
    TimeHm,
    TimeHms,
    DateTime,
    Text,
    /// A custom format code; assigned an id `>= CUSTOM_NUM_FMT_BASE` by the
    /// registry that holds it.
    Custom(String),
}

impl Default for NumFmt {
    fn default() -> Self {
        Self::General
    }
}

/// Built-in Excel number format ids (ECMA-376 fixed mapping).
pub mod builtin_num_fmts {
    pub const GENERAL: u32 = 0;
    pub const INTEGER: u32 = 1;
    pub const DECIMAL_2: u32 = 2;
    pub const THOUSANDS: u32 = 3;
    pub const THOUSANDS_DECIMAL: u32 = 4;
    pub const PERCENT: u32 = 9;
    pub const PERCENT_DECIMAL: u32 = 10;
    pub const SCIENTIFIC: u32 = 11;
    pub const DATE_MDY: u32 = 14;
    pub const DATE_DMY: u32 = 15;
    pub const DATE_DM: u32 = 16;
    pub const DATE_MY: u32 = 17;
    pub const TIME_HM_AP: u32 = 18;
    pub const TIME_HMS_AP: u32 = 19;
    pub const TIME_HM: u32 = 20;
    pub const TIME_HMS: u32 = 21;
    pub const DATETIME: u32 = 22;
    pub const TEXT: u32 = 49;
}

impl NumFmt {
    /// The builtin id this format maps to, or `None` for a custom code
    /// (the registry assigns those ids on insertion).
    pub fn builtin_id(&self) -> Option<u32> {
        use builtin_num_fmts::*;
        Some(match self {
            Self::General => GENERAL,
            Self::Integer => INTEGER,
            Self::Decimal2 => DECIMAL_2,
            Self::Thousands => THOUSANDS,
            Self::ThousandsDecimal2 => THOUSANDS_DECIMAL,
            Self::Percent => PERCENT,
            Self::PercentDecimal2 => PERCENT_DECIMAL,
            Self::Scientific => SCIENTIFIC,
            Self::DateMdy => DATE_MDY,
            Self::DateDmy => DATE_DMY,
            Self::DateDm => DATE_DM,
            Self::DateMy => DATE_MY,
            Self::TimeHmAmPm => TIME_HM_AP,
            Self::TimeHmsAmPm => TIME_HMS_AP,
            Self::TimeHm => TIME_HM,
            Self::TimeHms => TIME_HMS,
            Self::DateTime => DATETIME,
            Self::Text => TEXT,
            Self::Custom(_) => return None,
        })
    }

    /// The format code string as written into `styles.xml`.
    pub fn format_code(&self) -> &str {
        match self {
            Self::General => "General",
            Self::Integer => "0",
            Self::Decimal2 => "0.00",
            Self::Thousands => "#,##0",
            Self::ThousandsDecimal2 => "#,##0.00",
            Self::Percent => "0%",
            Self::PercentDecimal2 => "0.00%",
            Self::Scientific => "0.00E+00",
            Self::DateMdy => "m/d/yyyy",
            Self::DateDmy => "d-mmm-yy",
            Self::DateDm => "d-mmm",
            Self::DateMy => "mmm-yy",
            Self::TimeHmAmPm => "h:mm AM/PM",
            Self::TimeHmsAmPm => "h:mm:ss AM/PM",
            Self::TimeHm => "h:mm",
            Self::TimeHms => "h:mm:ss",
            Self::DateTime => "m/d/yyyy h:mm",
            Self::Text => "@",
            Self::Custom(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HorizontalAlign {
    #[default]
    General,
    Left,
    Center,
    Right,
    Justify,
    Fill,
    CenterContinuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VerticalAlign {
    #[default]
    Bottom,
    Top,
    Middle,
    Justify,
    Distributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Align {
    pub horizontal: HorizontalAlign,
    pub vertical: VerticalAlign,
    pub wrap: bool,
    pub indent: u32,
}

/// A full cell style record: font, fill, border, number format, alignment.
/// Two styles are equal iff every component is structurally equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CellStyle {
    pub font: Font,
    pub fill: Fill,
    pub border: Border,
    pub num_fmt: NumFmt,
    pub align: Align,
}

/// How a new style is applied to cells that already carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleApplyMode {
    /// Replace the cell's style outright.
    Replace,
    /// Component-wise overlay onto the existing style (see
    /// [`merge_overlay`]).
    Merge,
}

/// Overlay `overlay` onto `base`, per the component-level merge rules:
/// non-default overlay fields win; boolean emphasis flags (bold, italic,
/// underline, wrap) are OR'd; indent and size prefer the overlay when it
/// differs from the type's default.
pub fn merge_overlay(base: &CellStyle, overlay: &CellStyle) -> CellStyle {
    let default = CellStyle::default();

    let font = Font {
        name: if overlay.font.name != default.font.name {
            overlay.font.name.clone()
        } else {
            base.font.name.clone()
        },
        size: if (overlay.font.size - default.font.size).abs() > f64::EPSILON {
            overlay.font.size
        } else {
            base.font.size
        },
        bold: base.font.bold || overlay.font.bold,
        italic: base.font.italic || overlay.font.italic,
        underline: base.font.underline || overlay.font.underline,
        color: overlay.font.color.or(base.font.color),
    };

    let fill = if overlay.fill != Fill::None {
        overlay.fill
    } else {
        base.fill
    };

    let border = Border {
        top: if overlay.border.top != BorderSide::default() {
            overlay.border.top
        } else {
            base.border.top
        },
        bottom: if overlay.border.bottom != BorderSide::default() {
            overlay.border.bottom
        } else {
            base.border.bottom
        },
        left: if overlay.border.left != BorderSide::default() {
            overlay.border.left
        } else {
            base.border.left
        },
        right: if overlay.border.right != BorderSide::default() {
            overlay.border.right
        } else {
            base.border.right
        },
    };

    let num_fmt = if overlay.num_fmt != NumFmt::General {
        overlay.num_fmt.clone()
    } else {
        base.num_fmt.clone()
    };

    let align = Align {
        horizontal: if overlay.align.horizontal != HorizontalAlign::General {
            overlay.align.horizontal
        } else {
            base.align.horizontal
        },
        vertical: if overlay.align.vertical != VerticalAlign::default() {
            overlay.align.vertical
        } else {
            base.align.vertical
        },
        wrap: base.align.wrap || overlay.align.wrap,
        indent: if overlay.align.indent != 0 {
            overlay.align.indent
        } else {
            base.align.indent
        },
    };

    CellStyle {
        font,
        fill,
        border,
        num_fmt,
        align,
    }
}

/// A deduplicating registry of [`CellStyle`] values. Id 0 is always the
/// default style. Registering a style that structurally equals an existing
/// one returns the existing id.
#[derive(Debug, Clone)]
pub struct StyleRegistry {
    styles: Vec<CellStyle>,
    index: HashMap<CellStyle, u32>,
}

impl Default for StyleRegistry {
    fn default() -> Self {
        let default_style = CellStyle::default();
        let mut index = HashMap::new();
        index.insert(default_style.clone(), 0);
        Self {
            styles: vec![default_style],
            index,
        }
    }
}

impl StyleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-add. Returns the style's stable id.
    pub fn add(&mut self, style: CellStyle) -> u32 {
        if let Some(&id) = self.index.get(&style) {
            return id;
        }
        let id = self.styles.len() as u32;
        self.index.insert(style.clone(), id);
        self.styles.push(style);
        id
    }

    pub fn get(&self, id: u32) -> Option<&CellStyle> {
        self.styles.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        false // id 0 always present
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &CellStyle)> {
        self.styles.iter().enumerate().map(|(i, s)| (i as u32, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dedups_identical_styles() {
        let mut reg = StyleRegistry::new();
        let style = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let id1 = reg.add(style.clone());
        let id2 = reg.add(style);
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 2); // default + the new one
    }

    #[test]
    fn registry_default_is_id_zero() {
        let reg = StyleRegistry::new();
        assert_eq!(reg.get(0), Some(&CellStyle::default()));
    }

    #[test]
    fn registry_distinct_inputs_yield_distinct_ids() {
        let mut reg = StyleRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for bold in [false, true] {
            for italic in [false, true] {
                let style = CellStyle {
                    font: Font {
                        bold,
                        italic,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                seen.insert(reg.add(style));
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn merge_overlay_ors_boolean_flags() {
        let base = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let overlay = CellStyle {
            font: Font {
                italic: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge_overlay(&base, &overlay);
        assert!(merged.font.bold);
        assert!(merged.font.italic);
    }

    #[test]
    fn custom_num_fmt_keeps_its_code() {
        let fmt = NumFmt::Custom("#,##0.0000".to_string());
        assert_eq!(fmt.builtin_id(), None);
        assert_eq!(fmt.format_code(), "#,##0.0000");
    }
}
