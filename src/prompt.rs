use crate::protocol::ChatMessage;

const ASSISTANT_CUE: &str = "assistant: ";

/// Flattens a chat transcript into `role: content` lines followed by the
/// assistant cue.
pub fn build_chat_prompt(messages: &[ChatMessage]) -> String {
    let capacity = messages
        .iter()
        .map(|m| m.role.len() + m.content.len() + 3)
        .sum::<usize>()
        + ASSISTANT_CUE.len();

    let mut prompt = String::with_capacity(capacity);
    for message in messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str(ASSISTANT_CUE);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn renders_messages_in_order_with_cue() {
        let messages = vec![
            message("system", "You write Rust."),
            message("user", "Add two numbers."),
        ];
        assert_eq!(
            build_chat_prompt(&messages),
            "system: You write Rust.\nuser: Add two numbers.\nassistant: "
        );
    }

    #[test]
    fn free_form_roles_pass_through() {
        let prompt = build_chat_prompt(&[message("reviewer", "lgtm")]);
        assert_eq!(prompt, "reviewer: lgtm\nassistant: ");
    }

    #[test]
    fn rendering_is_deterministic() {
        let messages = vec![message("user", "multi\nline"), message("assistant", "")];
        let first = build_chat_prompt(&messages);
        assert_eq!(first, build_chat_prompt(&messages));
        assert!(first.ends_with("assistant: "));
    }
}
