use crate::compositor::Slot;
use crate::database::Character;

/// Layout-relative label used in place of a character's name inside
/// image prompts, so the prompt stays consistent with the composited
/// reference image.
pub fn position_label(slot: Slot, solo: bool) -> &'static str {
    if solo {
        return "character";
    }
    match slot {
        Slot::Left => "left character",
        Slot::Middle => "middle character",
        Slot::Right => "right character",
    }
}

/// Replace every `<Name>` token in a scene description with the
/// character's position label. Tokens for names not present in
/// `characters` are left alone (the analyzer already dropped unknown
/// references; anything remaining is plain text).
pub fn process(description: &str, characters: &[(Character, Slot)]) -> String {
    let solo = characters.len() == 1;
    let mut out = description.to_string();
    for (character, slot) in characters {
        let token = format!("<{}>", character.name);
        out = out.replace(&token, position_label(*slot, solo));
    }
    out
}

/// Build the prompt actually sent to the image model for one scene.
/// The reference canvas (when present) travels separately as an image
/// input; this text tells the model how to use it.
pub fn build_scene_prompt(
    processed_description: &str,
    style: &str,
    mood: Option<&str>,
    quote: Option<&str>,
    has_reference: bool,
) -> String {
    let mut prompt = format!(
        r#"Task: Illustrate one comic panel.

Style: {style}
Scene: {processed_description}
"#
    );

    if let Some(mood) = mood {
        prompt.push_str(&format!("Mood: {mood}\n"));
    }
    if let Some(quote) = quote {
        prompt.push_str(&format!("Include this line in a speech bubble: \"{quote}\"\n"));
    }
    if has_reference {
        prompt.push_str(
            "Use the attached reference image for character appearance; positions in the scene \
             text (left/middle/right character) refer to positions in the reference image.\n",
        );
    }
    prompt.push_str(
        "Guidelines: clear line art, readable bubbles, cohesive background, no watermarks or UI text.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(id: &str, name: &str) -> Character {
        Character {
            id: id.into(),
            user_id: "u1".into(),
            name: name.into(),
            avatar_url: String::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn solo_character_gets_plain_label() {
        let chars = vec![(character("c1", "Mina"), Slot::Middle)];
        let out = process("<Mina> walks the dog while <Mina> hums.", &chars);
        assert_eq!(out, "character walks the dog while character hums.");
    }

    #[test]
    fn labels_match_compositor_slots() {
        let chars = vec![
            (character("c1", "Mina"), Slot::Left),
            (character("c2", "Theo"), Slot::Right),
        ];
        let out = process("<Mina> waves at <Theo>.", &chars);
        assert_eq!(out, "left character waves at right character.");
    }

    #[test]
    fn unknown_tokens_are_left_alone() {
        let chars = vec![
            (character("c1", "Mina"), Slot::Left),
            (character("c2", "Theo"), Slot::Right),
        ];
        let out = process("<Mina> points at <TheMoon>.", &chars);
        assert_eq!(out, "left character points at <TheMoon>.");
    }

    #[test]
    fn no_resolved_tokens_survive() {
        let chars = vec![
            (character("c1", "A"), Slot::Left),
            (character("c2", "B"), Slot::Middle),
            (character("c3", "C"), Slot::Right),
        ];
        let out = process("<A> and <B> chase <C>. <C> laughs.", &chars);
        for name in ["<A>", "<B>", "<C>"] {
            assert!(!out.contains(name), "unresolved token {name} in {out:?}");
        }
        assert!(out.contains("middle character"));
    }

    #[test]
    fn scene_prompt_mentions_reference_only_when_present() {
        let with = build_scene_prompt("a scene", "ink wash", Some("wistful"), None, true);
        assert!(with.contains("reference image"));
        assert!(with.contains("Mood: wistful"));

        let without = build_scene_prompt("a scene", "ink wash", None, Some("hello"), false);
        assert!(!without.contains("reference image"));
        assert!(without.contains("speech bubble"));
    }
}
