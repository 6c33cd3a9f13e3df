// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message sanitization: strip image content when the target model does
//! not support it.
//!
//! Call [`strip_images_if_unsupported`] before handing a [`Context`] to a
//! [`crate::ModelAdapter`] to ensure image blocks are replaced with a text
//! placeholder whenever the model's `input_modalities` don't include
//! [`InputModality::Image`].

use crate::types::{ContentBlock, InputModality, Message};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Replace all image blocks in `messages` with a text placeholder when
/// `modalities` does not include [`InputModality::Image`]. No-op (returns
/// `messages` unchanged) when the model does support images.
pub fn strip_images_if_unsupported(
    messages: Vec<Message>,
    modalities: &[InputModality],
) -> Vec<Message> {
    if modalities.contains(&InputModality::Image) {
        return messages;
    }
    messages.into_iter().map(strip_message).collect()
}

fn strip_message(message: Message) -> Message {
    match message {
        Message::User(mut m) => {
            m.content = strip_blocks(m.content);
            Message::User(m)
        }
        Message::ToolResult(mut m) => {
            m.content = strip_blocks(m.content);
            Message::ToolResult(m)
        }
        other @ Message::Assistant(_) => other,
    }
}

fn strip_blocks(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|b| match b {
            ContentBlock::Image { .. } => ContentBlock::text(IMAGE_OMITTED),
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolResultMessage, UserMessage};

    fn text_only() -> Vec<InputModality> {
        vec![InputModality::Text]
    }

    fn vision() -> Vec<InputModality> {
        vec![InputModality::Text, InputModality::Image]
    }

    fn user_with_image() -> Message {
        Message::User(UserMessage {
            content: vec![
                ContentBlock::text("describe this"),
                ContentBlock::image("data:image/png;base64,ABC", "image/png"),
            ],
            timestamp: 0,
        })
    }

    #[test]
    fn no_op_when_image_supported() {
        let result = strip_images_if_unsupported(vec![user_with_image()], &vision());
        assert!(matches!(
            &result[0],
            Message::User(m) if m.content.iter().any(|b| matches!(b, ContentBlock::Image { .. }))
        ));
    }

    #[test]
    fn strips_image_blocks_to_text_placeholder() {
        let result = strip_images_if_unsupported(vec![user_with_image()], &text_only());
        match &result[0] {
            Message::User(m) => {
                assert_eq!(m.content.len(), 2);
                assert!(matches!(&m.content[1], ContentBlock::Text { text } if text == IMAGE_OMITTED));
            }
            other => panic!("expected User, got {other:?}"),
        }
    }

    #[test]
    fn strips_image_from_tool_result_blocks() {
        let msg = Message::ToolResult(ToolResultMessage {
            tool_call_id: "id-1".into(),
            tool_name: "read_image".into(),
            content: vec![ContentBlock::image("data:image/png;base64,XYZ", "image/png")],
            details: None,
            is_error: false,
            timestamp: 0,
        });
        let result = strip_images_if_unsupported(vec![msg], &text_only());
        match &result[0] {
            Message::ToolResult(m) => {
                assert!(matches!(&m.content[0], ContentBlock::Text { text } if text == IMAGE_OMITTED));
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn assistant_messages_pass_through_unchanged() {
        let msgs = vec![user_with_image()];
        let stripped = strip_images_if_unsupported(msgs, &text_only());
        assert_eq!(stripped.len(), 1);
    }
}
