use serde::Deserialize;

use crate::error::{GenerationError, ValidationError};

fn default_character_id() -> String {
    "char_001".to_string()
}

fn default_seed() -> i64 {
    123_456_789
}

/// Caller-supplied character description. Read-only once validated; the
/// wizard that collects these fields lives outside this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct CharacterSpec {
    #[serde(default = "default_character_id")]
    pub character_id: String,
    #[serde(default = "default_seed")]
    pub seed: i64,
    pub age: String,
    pub body_type: String,
    pub eyes: String,
    pub hair: String,
    pub outfit: String,
    #[serde(default)]
    pub accessories: String,
    #[serde(default)]
    pub other_features: String,
}

impl CharacterSpec {
    /// Rejects blank required fields before any upstream call is made. A
    /// silently defaulted field would desynchronize the variants, so this
    /// fails loudly instead.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("character_id", &self.character_id),
            ("age", &self.age),
            ("body_type", &self.body_type),
            ("eyes", &self.eyes),
            ("hair", &self.hair),
            ("outfit", &self.outfit),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError(format!("field '{name}' must not be empty")));
            }
        }
        Ok(())
    }
}

/// One named expression slot. The descriptor block is injected verbatim into
/// the prompt; the slug names archive entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionLabel {
    pub slug: &'static str,
    pub descriptor: &'static str,
}

const NORMAL_EXPRESSIONS: [ExpressionLabel; 4] = [
    ExpressionLabel {
        slug: "neutral",
        descriptor: "ニュートラル — 穏やかな基準表情\n    口: 自然 / 眉: 標準 / 目: 標準",
    },
    ExpressionLabel {
        slug: "smile",
        descriptor: "微笑み — 口角をわずかに上げた優しい笑顔\n    口: 軽いスマイル / 眉: やや下げ / 目: やや細め",
    },
    ExpressionLabel {
        slug: "surprised",
        descriptor: "驚き — 目を丸くして小さく口を開く\n    口: 小さく開く / 眉: 上がる / 目: 大きく",
    },
    ExpressionLabel {
        slug: "troubled",
        descriptor: "困り顔 — 申し訳なさそうに眉が寄る\n    口: への字（小） / 眉: 内側に寄る / 目: やや細め",
    },
];

const EMO_EXPRESSIONS: [ExpressionLabel; 6] = [
    ExpressionLabel {
        slug: "neutral",
        descriptor: "ニュートラル — 感情を抑えた静かな基準表情\n    口: 自然 / 眉: 標準 / 目: 伏し目がち",
    },
    ExpressionLabel {
        slug: "melancholy",
        descriptor: "憂い — 遠くを見るような物憂げな表情\n    口: わずかに下がる / 眉: やや下げ / 目: 細め",
    },
    ExpressionLabel {
        slug: "tearful",
        descriptor: "涙ぐみ — 目尻に涙が滲む\n    口: 震える / 眉: 内側に寄る / 目: 潤む",
    },
    ExpressionLabel {
        slug: "empty",
        descriptor: "虚ろ — 光のない目で正面を見る\n    口: 真一文字 / 眉: 標準 / 目: ハイライトなし",
    },
    ExpressionLabel {
        slug: "bitter_smile",
        descriptor: "苦笑い — 諦めの混じった弱い笑み\n    口: 片側だけ上がる / 眉: 下がる / 目: 細め",
    },
    ExpressionLabel {
        slug: "anguish",
        descriptor: "苦悶 — 歯を食いしばり目を強く閉じる\n    口: 固く結ぶ / 眉: 強く寄る / 目: 閉じる",
    },
];

const FANTASY_EXPRESSIONS: [ExpressionLabel; 8] = [
    ExpressionLabel {
        slug: "neutral",
        descriptor: "ニュートラル — 穏やかな基準表情\n    口: 自然 / 眉: 標準 / 目: 標準",
    },
    ExpressionLabel {
        slug: "smile",
        descriptor: "微笑み — 口角をわずかに上げた優しい笑顔\n    口: 軽いスマイル / 眉: やや下げ / 目: やや細め",
    },
    ExpressionLabel {
        slug: "surprised",
        descriptor: "驚き — 目を丸くして小さく口を開く\n    口: 小さく開く / 眉: 上がる / 目: 大きく",
    },
    ExpressionLabel {
        slug: "troubled",
        descriptor: "困り顔 — 申し訳なさそうに眉が寄る\n    口: への字（小） / 眉: 内側に寄る / 目: やや細め",
    },
    ExpressionLabel {
        slug: "determined",
        descriptor: "決意 — まっすぐ前を見据える強い眼差し\n    口: 引き結ぶ / 眉: 上がる / 目: 鋭く",
    },
    ExpressionLabel {
        slug: "battle_cry",
        descriptor: "雄叫び — 口を大きく開けて叫ぶ\n    口: 大きく開く / 眉: 強く上がる / 目: 見開く",
    },
    ExpressionLabel {
        slug: "casting",
        descriptor: "詠唱 — 集中して目を半分閉じる\n    口: 小さく開く / 眉: 標準 / 目: 半眼",
    },
    ExpressionLabel {
        slug: "triumphant",
        descriptor: "勝ち誇り — 自信に満ちた不敵な笑み\n    口: にやり / 眉: 片方上がる / 目: 標準",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Emo,
    Fantasy,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Mode> {
        match value.trim().to_lowercase().as_str() {
            "normal" => Some(Mode::Normal),
            "emo" => Some(Mode::Emo),
            "fantasy" => Some(Mode::Fantasy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Emo => "emo",
            Mode::Fantasy => "fantasy",
        }
    }

    pub fn profile(&self) -> ModeProfile {
        match self {
            Mode::Normal => ModeProfile {
                background_directive:
                    "背景は完全にビビッドなグリーン#00FF00。質感テクスチャや落ち影は一切入れない。",
                background_framing: "完全なグリーン (#00FF00)。no texture, no vignette, no gradient, no floor shadow.",
                palette_directive: "overall color grading: pale tones, light grayish tones, soft muted pastel tones.\nairy and slightly hazy atmosphere, emotional pastel look.\nno vivid or highly saturated colors, no harsh contrast.\nlow-contrast tonal range, avoid crushed blacks and clipped whites.",
                extra_forbidden: "白背景、グリーン以外の背景色",
                removes_background: true,
            },
            Mode::Emo => ModeProfile {
                background_directive:
                    "背景は完全な黒#000000。質感テクスチャや落ち影は一切入れない。",
                background_framing: "完全な黒 (#000000)。no texture, no vignette, no gradient, no floor shadow.",
                palette_directive: "overall color grading: desaturated cool tones, deep shadows with soft gradients.\nmelancholic, subdued atmosphere with muted highlights.\nno vivid or highly saturated colors.\nretain detail in dark regions, avoid crushed blacks on the figure itself.",
                extra_forbidden: "白背景、明るい背景、グリーンバック",
                removes_background: false,
            },
            Mode::Fantasy => ModeProfile {
                background_directive:
                    "背景は完全な黒#000000。質感テクスチャや落ち影は一切入れない。",
                background_framing: "完全な黒 (#000000)。no texture, no vignette, no gradient, no floor shadow.",
                palette_directive: "overall color grading: rich jewel tones with luminous accents.\npainterly high-fantasy illustration look, soft magical glow on the figure only.\nkeep the glow tight to the character, never spilling onto the background.\nbalanced contrast, avoid clipped whites.",
                extra_forbidden: "白背景、風景背景、グリーンバック、背景に及ぶ発光エフェクト",
                removes_background: false,
            },
        }
    }

    pub fn expressions(&self) -> &'static [ExpressionLabel] {
        match self {
            Mode::Normal => &NORMAL_EXPRESSIONS,
            Mode::Emo => &EMO_EXPRESSIONS,
            Mode::Fantasy => &FANTASY_EXPRESSIONS,
        }
    }
}

/// Strategy bundle selected by [`Mode`]: prompt rules plus whether the
/// background cleanup pipeline runs on the results.
#[derive(Debug, Clone, Copy)]
pub struct ModeProfile {
    pub background_directive: &'static str,
    pub background_framing: &'static str,
    pub palette_directive: &'static str,
    pub extra_forbidden: &'static str,
    pub removes_background: bool,
}

/// One inbound generation call: a validated spec, the mode, and the mode's
/// fixed ordered expression slots.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub character: CharacterSpec,
    pub mode: Mode,
    pub labels: Vec<ExpressionLabel>,
}

impl GenerationRequest {
    pub fn new(character: CharacterSpec, mode: Mode) -> Result<Self, GenerationError> {
        character.validate()?;
        Ok(Self {
            character,
            mode,
            labels: mode.expressions().to_vec(),
        })
    }
}
