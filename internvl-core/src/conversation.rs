/// System prompt InternVL checkpoints are trained with.
pub const INTERNVL_SYSTEM_MESSAGE: &str = "你是由上海人工智能实验室联合商汤科技开发的书生多模态大模型，英文名叫InternVL, 是一个有用无害的人工智能助手。";

/// A prompt under construction for one of the InternVL chat templates.
///
/// Prompts use the MPT layout: `system + sep`, then `role + message + sep` for each completed
/// message, then the bare role of an open turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    system_template: &'static str,
    system_message: String,
    roles: [&'static str; 2],
    sep: &'static str,
    messages: Vec<(&'static str, Option<String>)>,
}

impl Conversation {
    /// Known templates: `internlm2-chat`, `Hermes-2`, `internvl2_5`, `phi3-chat`.
    pub fn from_template(name: &str) -> Option<Self> {
        let (system_template, roles, sep) = match name {
            "internlm2-chat" | "Hermes-2" => (
                "<|im_start|>system\n{system_message}",
                ["<|im_start|>user\n", "<|im_start|>assistant\n"],
                "<|im_end|>",
            ),
            "internvl2_5" => (
                "<|im_start|>system\n{system_message}",
                ["<|im_start|>user\n", "<|im_start|>assistant\n"],
                "<|im_end|>\n",
            ),
            "phi3-chat" => (
                "<|system|>\n{system_message}",
                ["<|user|>\n", "<|assistant|>\n"],
                "<|end|>",
            ),
            _ => return None,
        };
        Some(Self {
            system_template,
            system_message: INTERNVL_SYSTEM_MESSAGE.to_string(),
            roles,
            sep,
            messages: Vec::new(),
        })
    }

    pub fn set_system_message(&mut self, system_message: impl Into<String>) {
        self.system_message = system_message.into();
    }

    /// (user, assistant)
    pub fn roles(&self) -> (&'static str, &'static str) {
        (self.roles[0], self.roles[1])
    }

    pub fn sep(&self) -> &str {
        self.sep
    }

    pub fn append_user(&mut self, message: impl Into<String>) {
        self.messages.push((self.roles[0], Some(message.into())));
    }

    /// `None` leaves the assistant turn open for generation.
    pub fn append_assistant(&mut self, message: Option<String>) {
        self.messages.push((self.roles[1], message));
    }

    pub fn get_prompt(&self) -> String {
        let mut ret = self
            .system_template
            .replace("{system_message}", &self.system_message);
        ret.push_str(self.sep);
        for (role, message) in &self.messages {
            ret.push_str(role);
            match message {
                Some(message) if !message.is_empty() => {
                    ret.push_str(message);
                    ret.push_str(self.sep);
                }
                _ => {}
            }
        }
        ret
    }
}
