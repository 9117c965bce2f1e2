// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context};
use netlogind_protocol::Message;
use tracing::debug;

use crate::{consts, protocol::MessageStream, secret::Secret};

/// How a single conversation item should be presented to the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Style {
    /// Ask a question and show the answer as it is typed.
    EchoOn,
    /// Ask a question whose answer must not be displayed. The captured
    /// reply is treated as a secret and scrubbed after use.
    EchoOff,
    /// Informational text, no reply expected.
    Info,
    /// Error text, no reply expected.
    Error,
}

/// One item in a conversation batch handed to us by the auth back end.
#[derive(Copy, Clone, Debug)]
pub struct Prompt<'a> {
    pub style: Style,
    pub text: &'a str,
}

/// The capability the core hands the auth back end so it can talk to
/// the remote user. It turns prompts into Text/Prompt frames on the
/// conversation channel and interprets Reply frames coming back.
///
/// During session setup the back end is only allowed to emit
/// informational text; a conversation created with `reject_prompts`
/// refuses Echo{On,Off} items and hands the back end an error instead.
pub struct Conversation<'a> {
    stream: &'a mut MessageStream,
    reject_prompts: bool,
    max_reply: usize,
}

impl<'a> Conversation<'a> {
    pub fn new(stream: &'a mut MessageStream) -> Self {
        Conversation { stream, reject_prompts: false, max_reply: consts::MAX_CONV_REPLY }
    }

    /// A conversation for the session-open phase: prompts are refused,
    /// only text passes through.
    pub fn reject_prompts(stream: &'a mut MessageStream) -> Self {
        Conversation { stream, reject_prompts: true, max_reply: consts::MAX_CONV_REPLY }
    }

    /// Drives one batch of prompts and returns the captured replies,
    /// one per Echo{On,Off} item, in order.
    ///
    /// On any failure every reply captured so far is scrubbed before
    /// the error is returned; the back end never has to clean up after
    /// a half-finished conversation.
    pub fn converse(&mut self, prompts: &[Prompt]) -> anyhow::Result<Vec<Secret>> {
        let mut replies = Vec::new();
        for prompt in prompts {
            debug!("conversation item style={:?}", prompt.style);
            match prompt.style {
                Style::EchoOn | Style::EchoOff => {
                    if self.reject_prompts {
                        // the captured replies drop (and scrub) here
                        return Err(anyhow!("prompts are not allowed during session setup"));
                    }
                    self.stream
                        .write_message(&Message::Text(prompt.text.as_bytes().to_vec()))
                        .context("writing prompt text")?;
                    self.stream
                        .write_message(&Message::Prompt(prompt.style == Style::EchoOn))
                        .context("writing prompt")?;
                    let reply = Secret::new(self.stream.read_reply().context("reading reply")?);
                    if reply.len() > self.max_reply {
                        return Err(anyhow!(
                            "conversation reply exceeds the {} byte limit",
                            self.max_reply
                        ));
                    }
                    replies.push(reply);
                }
                Style::Info | Style::Error => {
                    let mut text = prompt.text.as_bytes().to_vec();
                    if !text.is_empty() && !text.ends_with(b"\n") {
                        text.push(b'\n');
                    }
                    self.stream
                        .write_message(&Message::Text(text))
                        .context("writing info text")?;
                }
            }
        }

        Ok(replies)
    }

    /// Sends a single line of informational text to the user.
    pub fn info(&mut self, text: &str) -> anyhow::Result<()> {
        self.converse(&[Prompt { style: Style::Info, text }])?;
        Ok(())
    }
}
