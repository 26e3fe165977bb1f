//! Instruction payload composition.
//!
//! All model-facing text lives here: the per-turn system prompt
//! (parameterized by phase, mode, style, and detected patterns), the
//! scheduled checkin prompts, and the auxiliary extraction/deep-scan
//! prompts. The strings are product copy; the control flow around them
//! lives with the components that use them.

use crate::store::types::{CoachingStyle, Mode, PatternRecord, Phase, UserProfile};

/// How many top patterns (by count) are surfaced to the model.
const TOP_PATTERNS: usize = 5;

/// Build the system prompt for a regular conversational turn.
pub fn system_prompt(
    profile: &UserProfile,
    patterns: &[PatternRecord],
    soft_crisis: bool,
) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(
        "Ты — AI-наставник. Помогаешь разобраться с тем, что реально мешает: \
         в деньгах, отношениях, жизни в целом. Говоришь по-русски, коротко и по делу. \
         Каждый разговор двигаешь к конкретному действию.\n\n",
    );

    prompt.push_str(&format!("Пользователь: {}.\n", profile.name));

    match profile.mode {
        Mode::Support => {
            prompt.push_str(
                "Режим: поддержка. Сейчас не коучинг — просто выслушай, отражай чувства, \
                 не дави, не давай заданий и не спрашивай про цели.\n",
            );
        }
        Mode::Coaching => {
            prompt.push_str(&format!("Фаза работы: {}.\n", phase_instruction(profile.phase)));
            if let Some(ref goal) = profile.goal {
                prompt.push_str(&format!("Цель пользователя: {goal}.\n"));
                if let Some(ref deadline) = profile.goal_deadline {
                    prompt.push_str(&format!("Дедлайн цели: {deadline}.\n"));
                }
            }
        }
    }

    prompt.push_str(&format!("Стиль общения: {}.\n", style_instruction(profile.style)));

    if !patterns.is_empty() {
        prompt.push_str("\nЗамеченные паттерны самосаботажа (по убыванию частоты):\n");
        for p in patterns.iter().take(TOP_PATTERNS) {
            prompt.push_str(&format!("- {} (встречалось {} раз)\n", p.label, p.count));
        }
        prompt.push_str(
            "Мягко называй паттерн, когда он появляется снова, и возвращай к сути.\n",
        );
    }

    if soft_crisis {
        prompt.push_str(
            "\nВажно: в сообщении звучит отчаяние. Сначала поддержи и признай чувства, \
             только потом — работа. Никакого давления в этом ответе.\n",
        );
    }

    prompt
}

fn phase_instruction(phase: Phase) -> &'static str {
    match phase {
        Phase::Onboarding => {
            "знакомство — узнай, с чем человек пришёл, не торопи с целями"
        }
        Phase::Diagnosis => {
            "диагностика — выясняй, что на самом деле мешает, задавай уточняющие вопросы"
        }
        Phase::Goal => {
            "постановка цели — доведи до конкретной, измеримой цели со сроком"
        }
        Phase::Planning => {
            "план — разбей цель на конкретные шаги, определи с чего начать"
        }
        Phase::Daily => {
            "ежедневная работа — спрашивай про сделанное, разбирай сорванное, держи темп"
        }
    }
}

fn style_instruction(style: CoachingStyle) -> &'static str {
    match style {
        CoachingStyle::Soft => {
            "мягкий — поддерживай, задавай мягкие вопросы, помогай найти ответы самому"
        }
        CoachingStyle::Balanced => {
            "сбалансированный — честно и прямо, но без давления, поддержка и вызов в равных долях"
        }
        CoachingStyle::Direct => {
            "жёсткий — прямо, называй вещи своими именами, не принимай отговорки"
        }
    }
}

// ── Checkin prompts ─────────────────────────────────────────────────

pub const MORNING_CHECKIN: &str = "Ты — AI-наставник. Сейчас утро. Твоя задача — короткий утренний чек-ин.\n\
Напомни пользователю о его цели и спроси: что конкретно он сделает сегодня для её достижения?\n\
Максимум 2-3 предложения. Один вопрос в конце. Без воды.";

pub const EVENING_CHECKIN: &str = "Ты — AI-наставник. Сейчас вечер. Твоя задача — вечерний чек-ин.\n\
Спроси пользователя: выполнил ли он то, что планировал утром?\n\
Если нет — не жалей, спроси почему и что изменит завтра.\n\
Максимум 2-3 предложения. Один вопрос в конце.";

pub const WEEKLY_REVIEW: &str = "Ты — AI-наставник. Сейчас конец недели. Проведи короткий еженедельный разбор.\n\
На основе профиля пользователя:\n\
1. Отметь прогресс (если есть)\n\
2. Назови главный паттерн недели\n\
3. Задай один главный вопрос на следующую неделю\n\
Максимум 4-5 предложений.";

/// Profile suffix appended to a checkin system prompt.
pub fn checkin_profile_suffix(profile: &UserProfile) -> String {
    format!(
        "\n\nПрофиль: {}, цель: {}",
        profile.name,
        profile.goal.as_deref().unwrap_or("не поставлена")
    )
}

// ── Auxiliary call prompts ──────────────────────────────────────────

/// Prompt for the commitment extraction call.
pub fn commitment_extraction(assistant_text: &str) -> String {
    format!(
        "Проанализируй ответ наставника. Если в нём есть конкретное \
         обязательство/задание для пользователя с дедлайном, верни JSON: \
         {{\"action\": \"описание действия\", \"deadline\": \"когда\"}}. \
         Если нет конкретного обязательства — верни JSON: {{\"action\": null}}. \
         Отвечай ТОЛЬКО JSON, без пояснений.\n\nОтвет наставника:\n{assistant_text}"
    )
}

/// Prompt for the deep pattern analysis call over recent user messages.
pub fn deep_pattern_analysis(text_block: &str) -> String {
    format!(
        "Проанализируй последние сообщения пользователя в коучинговом диалоге. \
         Выяви паттерны поведения из списка:\n\
         - weak_commitment: слабые обязательства, избегание конкретики\n\
         - blame_external: перекладывание ответственности на других\n\
         - low_self_worth: самообесценивание, неверие в себя\n\
         - avoidance: уход от темы, смена темы\n\
         - seeking_pity: поиск жалости вместо решений\n\
         - vague: размытые формулировки без конкретики\n\
         - not_ready: паттерн \"ещё не готов/не время\"\n\n\
         Сообщения:\n{text_block}\n\n\
         Верни ТОЛЬКО JSON массив найденных паттернов (может быть пустым):\n\
         [{{\"type\": \"pattern_type\", \"text\": \"краткое описание на русском\"}}]"
    )
}
