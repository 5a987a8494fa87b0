use crate::character::{CharacterSpec, ExpressionLabel, Mode};

/// Appended to every generation call as a trailer block.
pub const NEGATIVE_PROMPT: &str = "low quality, blurry, watermark, text, signature, multiple people, inconsistent character, wrong background color";

fn or_none(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "なし"
    } else {
        trimmed
    }
}

/// Shared description block for one request: everything except the expression
/// is fixed across all variants. Pure string assembly, identical bytes for
/// identical inputs.
fn base_prompt(character: &CharacterSpec, mode: Mode) -> String {
    let profile = mode.profile();
    format!(
        "【目的】\n\
         同一キャラクターのラノベ風立ち絵を1枚生成する。\n\
         この画像は指定された表情以外の要素を完全に固定し、画面内には必ず単一のキャラクターのみを描写する。\n\
         {background}全身が頭からつま先までフレーム内に完全に収まること。\n\
         \n\
         【色調（数値を使わない指定）】\n\
         {palette}\n\
         \n\
         【線（輪郭）】\n\
         outline color: soft, desaturated cool gray; not pure black.\n\
         outer contour lines: slightly bolder to hold silhouette.\n\
         inner facial/detail lines: finer and lighter gray.\n\
         consistent, clean, thin lines; no sketchy strokes or messy hatching.\n\
         \n\
         【ライティング】\n\
         soft, diffused frontal key light.\n\
         gentle ambient light with a cool tint.\n\
         shadows should be light grayish, never pure black.\n\
         very thin cool rim light for subtle depth.\n\
         overall gentle, low-contrast illumination.\n\
         \n\
         【キャラクター固定仕様（全画像共通・厳守）】\n\
         年齢: {age}\n\
         体型: {body_type}\n\
         目: {eyes}\n\
         髪: {hair}\n\
         服装: {outfit}\n\
         アクセサリー: {accessories}\n\
         その他の特徴: {other_features}\n\
         \n\
         【構図・フレーミング（全画像共通・厳守）】\n\
         ショット: 全身。頭から足先まで切れずにフレーム内に収める。左右にわずかな余白を取り、中央に配置。\n\
         カメラ: 正面、俯瞰なし、50mm相当の自然なパース。レンズ歪みなし。被写界深度は深く、全身にフォーカス。\n\
         ポーズ: 直立、肩の力みなし、両腕は体側、指先は自然。足元まで見える。足の向きは正面〜やや内振り程度。\n\
         背景: {background_framing}\n\
         \n\
         【禁止（全画像）】\n\
         背景小物、武器、他キャラ、文字、透かし（watermark）、粒子ノイズ、紙テクスチャ、床影・床反射、過度な光沢、強コントラスト、切れフレーミング、{extra_forbidden}。\n\
         \n\
         【出力ルール】\n\
         - この画像は単一の全身立ち絵1枚。フレーム内の人物は一人のみ。\n\
         - 差分は「顔の表情のみ」（この後ろに続く表情指定に従う）。髪・衣装・体格・ポーズ・画角・線の太さは完全固定。\n\
         - 追加のキャラクター、複数人、反射像、鏡像の描写は禁止。",
        background = profile.background_directive,
        palette = profile.palette_directive,
        age = character.age.trim(),
        body_type = character.body_type.trim(),
        eyes = character.eyes.trim(),
        hair = character.hair.trim(),
        outfit = character.outfit.trim(),
        accessories = or_none(&character.accessories),
        other_features = or_none(&character.other_features),
        background_framing = profile.background_framing,
        extra_forbidden = profile.extra_forbidden,
    )
}

fn expression_block(index: usize, label: &ExpressionLabel) -> String {
    format!(
        "【各画像の表情差分（顔のみ変更）】\n#{number}: {descriptor}",
        number = index + 1,
        descriptor = label.descriptor,
    )
}

/// Full standalone prompt for one expression slot. Used for the anchor and
/// for the fresh-generation fallback.
pub fn standalone_prompt(
    character: &CharacterSpec,
    mode: Mode,
    index: usize,
    label: &ExpressionLabel,
) -> String {
    format!(
        "{}\n{}",
        base_prompt(character, mode),
        expression_block(index, label)
    )
}

/// Prompt for an edit-conditioned call: the anchor image rides along as a
/// reference, so the trailer pins everything except the face.
pub fn edit_prompt(
    character: &CharacterSpec,
    mode: Mode,
    index: usize,
    label: &ExpressionLabel,
) -> String {
    format!(
        "{}\n{}\n\n【追加指示】参照画像として添付された既存の立ち絵を使用し、\
         髪型・衣装・体格・ポーズ・照明・背景・線のタッチは一切変更せず、\
         顔の表情だけを指定された内容に差し替える。ビフォーアフターで人物は完全に同一であり、\
         追加の人物や構図変更は厳禁。",
        base_prompt(character, mode),
        expression_block(index, label)
    )
}
