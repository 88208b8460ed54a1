//! Prompt assembly for the response workflows.
//!
//! System prompts are built per account: tone, writing style, and the
//! realtor's bio/market area are embedded directly so every generation
//! speaks with the account's voice.

use crate::llm::ChatMessage;
use crate::respond::scenario::Scenario;
use crate::store::{AccountSettings, Direction, EmailMessage};

/// Generation parameters for one LLM call.
#[derive(Debug, Clone, Copy)]
pub struct GenParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

/// Prompt configuration for a scenario: the writer's system prompt and
/// parameters, plus the optional strategist (middleman) stage.
#[derive(Debug, Clone)]
pub struct PromptConfig {
    pub system: String,
    pub params: GenParams,
    pub middleman: Option<(String, GenParams)>,
}

/// Build the scenario's prompt configuration with the account's
/// preferences embedded.
pub fn prompt_config(scenario: Scenario, account: &AccountSettings) -> PromptConfig {
    let tone = account
        .tone
        .as_deref()
        .map(|t| format!(" in a {t} tone"))
        .unwrap_or_default();
    let style = account
        .writing_style
        .as_deref()
        .map(|s| format!(" using a {s} writing style"))
        .unwrap_or_default();
    let bio = realtor_bio(account);

    match scenario {
        Scenario::Summarizer => PromptConfig {
            system: format!(
                "You are writing a summary email based on strategic instructions. {bio}Follow \
                 the provided instructions exactly to create a summary{tone}{style}.\n\nThe \
                 instructions will specify what key points to include. Do NOT add, infer, or \
                 invent any details beyond what's specified. Output only the summary content—no \
                 headers, no extra commentary."
            ),
            params: GenParams { max_tokens: 150, temperature: 0.3, top_p: 1.0 },
            middleman: Some((
                "You are a content strategist analyzing real estate email threads for \
                 summarization. Analyze the conversation and create specific instructions for \
                 what should be included in the summary.\n\nOutput format:\nKEY_POINTS:\n- \
                 [Main points from the conversation]\n\nCLIENT_INTENT:\n- [What the client is \
                 trying to accomplish]\n\nACTION_ITEMS:\n- [Concrete next steps mentioned]\n\n\
                 Focus only on extracting true information. Do NOT add, infer, or invent any \
                 details."
                    .to_string(),
                GenParams { max_tokens: 300, temperature: 0.2, top_p: 0.9 },
            )),
        },
        Scenario::IntroEmail => PromptConfig {
            system: format!(
                "You are a realtor writing an introductory email based on strategic \
                 instructions. {bio}Follow the provided instructions to write a brief, \
                 professional introductory email{tone}{style}.\n\nThe instructions will specify \
                 what to address, what questions to ask, and the overall approach. Write \
                 naturally and conversationally based on these instructions.\n\nIMPORTANT \
                 GUIDELINES:\n- Do NOT invent specific market data, property details, or \
                 services not mentioned in the instructions\n- Do NOT include email signatures, \
                 formal closings, or sign-offs like \"Best regards,\" \"Sincerely,\" or \
                 \"[Your Name]\"."
            ),
            params: GenParams { max_tokens: 200, temperature: 0.2, top_p: 0.8 },
            middleman: Some((
                "You are a content strategist for real estate intro emails. Analyze the \
                 initial client contact and create specific instructions for the introductory \
                 response.\n\nOutput format:\nGREETING_APPROACH:\n- [Personal/Professional/\
                 Warm - based on client's tone]\n\nKEY_POINTS_TO_ADDRESS:\n- [Acknowledge their \
                 specific inquiry/interest]\n\nQUALIFICATION_QUESTIONS:\n- [Most important \
                 qualifying questions]\n\nNEXT_STEPS:\n- [Logical next step to suggest]\n\n\
                 Only include points that are relevant to their initial message. Do NOT invent \
                 services or details not mentioned."
                    .to_string(),
                GenParams { max_tokens: 200, temperature: 0.2, top_p: 0.9 },
            )),
        },
        Scenario::ContinuationEmail => PromptConfig {
            system: format!(
                "You are a realtor writing a continuation email based on strategic \
                 instructions. {bio}Follow the provided instructions to respond{tone}{style}.\n\n\
                 The instructions will specify what to acknowledge, what questions to ask, and \
                 what next steps to suggest. Write naturally and conversationally based on \
                 these instructions.\n\nDo NOT invent specific properties, market data, or \
                 services not mentioned in the instructions. Keep responses conversational and \
                 focused on the guidance provided.\nDo NOT include email signatures, formal \
                 closings, or sign-offs like \"Best regards,\" \"Sincerely,\" or \"[Your \
                 Name]\". Do include some intro like \"Hey, [Name],\"."
            ),
            params: GenParams { max_tokens: 200, temperature: 0.2, top_p: 0.8 },
            middleman: Some((
                "You are a content strategist for ongoing real estate email conversations. \
                 Analyze the conversation flow and create specific instructions for the \
                 continuation response.\n\nOutput format:\nACKNOWLEDGE:\n- [What to acknowledge \
                 from their latest message]\n\nKEY_CONVERSATION_POINTS:\n- [Main points that \
                 need to be addressed]\n\nQUALIFICATION_QUESTIONS:\n- [Follow-up questions to \
                 qualify their needs]\n\nNEXT_STEPS:\n- [Specific helpful next step to \
                 suggest]\n\nFocus on progressing the conversation and gathering more \
                 qualifying information. Only reference details actually mentioned in the \
                 conversation."
                    .to_string(),
                GenParams { max_tokens: 250, temperature: 0.2, top_p: 0.9 },
            )),
        },
        Scenario::ClosingReferral => PromptConfig {
            system: format!(
                "You are writing a closing/referral email based on strategic instructions. \
                 {bio}Follow the provided instructions to write your response{tone}{style}.\n\n\
                 The instructions will specify the closing approach, what to recap, and what \
                 next steps to outline. Write based on these strategic directions.\n\nCRITICAL \
                 REQUIREMENTS:\n- Output ONLY the email body content\n- Maintain your realtor \
                 persona and expertise\n- Do NOT invent details not mentioned in the \
                 instructions\n- Do NOT include email signatures, formal closings, or \
                 sign-offs like \"Best regards,\" \"Sincerely,\" or \"[Your Name]\"."
            ),
            params: GenParams { max_tokens: 200, temperature: 0.3, top_p: 0.8 },
            middleman: Some((
                "You are a content strategist for real estate closing/referral emails. Analyze \
                 the conversation and determine the appropriate closing approach and \
                 instructions.\n\nOutput format:\nCLOSING_TYPE:\n- [QUALIFIED_HANDOFF / \
                 REFERRAL / FUTURE_OPPORTUNITY]\n\nCLIENT_SUMMARY:\n- [Key requirements, \
                 timeline, and readiness gathered from the conversation]\n\nNEXT_STEPS_TO_\
                 SPECIFY:\n- [Concrete action items and how they should proceed]\n\nOnly \
                 reference details and next steps that were actually established in the \
                 conversation."
                    .to_string(),
                GenParams { max_tokens: 300, temperature: 0.2, top_p: 0.9 },
            )),
        },
        Scenario::FollowUp => PromptConfig {
            system: format!(
                "You are a realtor writing a follow-up email based on strategic instructions. \
                 {bio}Follow the provided instructions to write a follow-up email{tone}{style}.\n\n\
                 The instructions will specify what to reference from previous communications, \
                 what value to provide, and how to re-engage. Write naturally and \
                 conversationally based on these instructions.\n\nCRITICAL REQUIREMENTS:\n- \
                 Output ONLY the email body content\n- Do NOT be overly persistent or pushy. \
                 Maintain a helpful, professional tone that shows you're available when \
                 they're ready.\n- Do NOT include email signatures, formal closings, or \
                 sign-offs like \"Best regards,\" \"Sincerely,\" or \"[Your Name]\". Do \
                 include some intro like \"Hi [Name],\"\n- Do NOT add any commentary, \
                 explanations, or meta-text about the email"
            ),
            params: GenParams { max_tokens: 200, temperature: 0.2, top_p: 0.8 },
            middleman: Some((
                "You are a content strategist for real estate follow-up emails. Analyze the \
                 conversation history and create specific instructions for re-engaging a \
                 prospect who hasn't responded.\n\nOutput format:\nPREVIOUS_CONTEXT:\n- [What \
                 was discussed in the last email they received]\n\nVALUE_TO_PROVIDE:\n- \
                 [Relevant insight or resource to share, or ask if circumstances have \
                 changed]\n\nRE_ENGAGEMENT_QUESTIONS:\n- [Question about timeline changes, or \
                 offer to help with a specific aspect]\n\nKeep it brief and focused on being \
                 helpful rather than pushy. Reference specific details from their previous \
                 communications."
                    .to_string(),
                GenParams { max_tokens: 200, temperature: 0.2, top_p: 0.9 },
            )),
        },
    }
}

/// Selector system prompt and parameters.
pub fn selector_prompt() -> (&'static str, GenParams) {
    (
        "You are a classifier for real estate email automation. Choose exactly one action: \
         summarizer, intro_email, continuation_email, or closing_referral. Output only that \
         keyword.\n\nRules:\n- intro_email: First contact from a new lead\n- \
         continuation_email: Ongoing conversation that needs more qualification/development\n- \
         closing_referral: Lead is ready for human contact OR needs referral\n- summarizer: \
         Thread is too long and needs condensing before processing\n\nPrioritize \
         continuation_email to maximize information gathering before flagging for human \
         intervention.",
        GenParams { max_tokens: 4, temperature: 0.0, top_p: 1.0 },
    )
}

/// Reviewer system prompt and parameters.
pub fn reviewer_prompt() -> (&'static str, GenParams) {
    (
        "You are a business intelligence reviewer determining when a real estate conversation \
         requires the realtor's personal attention. Output exactly one keyword: FLAG or \
         CONTINUE.\n\nFLAG only when the conversation contains issues that require the \
         realtor's direct expertise or intervention:\n1. Pricing discussions, negotiations, or \
         offer-related conversations\n2. Complex market analysis requests or competitive \
         property comparisons\n3. Scheduling conflicts, urgent timing issues, or \
         time-sensitive opportunities\n4. Client expressing dissatisfaction, confusion, or \
         service concerns\n5. Legal/contractual questions beyond basic information\n6. \
         Financing complications or unique lending situations\n7. Referral requests or \
         partnership/vendor discussions\n8. The AI appears to have given potentially incorrect \
         market information\n9. Conversation is going in circles or the AI seems unable to \
         progress the lead\n10. Client requesting direct contact or phone calls\n\n\
         Additionally, respond with FLAG if there are any tangibles the AI is not able to \
         properly answer (meeting times, showing times, etc.)\n\nCONTINUE for typical \
         conversations like initial inquiries, basic qualification questions, general market \
         information, standard showing requests, and routine follow-ups.\n\nRemember: the goal \
         is identifying when the REALTOR'S specific expertise is needed, not content safety.",
        GenParams { max_tokens: 5, temperature: 0.0, top_p: 1.0 },
    )
}

/// Format a conversation as alternating chat turns: inbound email is
/// the user, outbound (ours) is the assistant.
pub fn conversation_turns(chain: &[EmailMessage]) -> Vec<ChatMessage> {
    chain
        .iter()
        .map(|msg| {
            let content = format!("Subject: {}\n\nBody: {}", msg.subject, msg.body);
            match msg.direction {
                Direction::Inbound => ChatMessage::user(content),
                Direction::Outbound => ChatMessage::assistant(content),
            }
        })
        .collect()
}

fn realtor_bio(account: &AccountSettings) -> String {
    let location_context = account
        .location
        .as_deref()
        .filter(|l| !l.is_empty())
        .map(|l| format!("You specialize in the {l} market. "))
        .unwrap_or_default();

    match account.bio.as_deref().filter(|b| !b.is_empty()) {
        Some(bio) => format!(
            "The realtor you are emulating wrote this bio: \"{bio}\" {location_context}Use \
             this information to inform your responses and maintain consistency with their \
             professional identity. "
        ),
        None if !location_context.is_empty() => format!(
            "You are a local real estate expert. {location_context}Use your market expertise \
             to inform your responses. "
        ),
        None => String::new(),
    }
}
