//! Instruction prompts for question generation and answer evaluation
//!
//! Both tasks render a ChatML conversation: a fixed system turn, a user turn
//! carrying the caller's text, and an open assistant turn. Slot values are
//! substituted as-is.

use crate::error::PromptError;
use crate::types::TaskKind;

/// Marker the question generator is told to prefix its question with
pub const QUESTION_MARKER: &str = "**Question :** ";

/// Substituted for an empty student answer so the grader always sees input
pub const NO_ANSWER_SENTINEL: &str = "l'élève ne répond pas !";

const QUESTION_SYSTEM: &str = "\
You are an expert question-generation assistant.
When the user gives you a block of text, you must:
1. Generate exactly one relevant question in French based solely on the provided text.
2. Never add any comments, explanations, or additional questions.
3. Use the exact output format:

**Question :** [votre question]

Always follow this layout strictly, with no extra lines or sections.";

const QUESTION_INSTRUCTION: &str = "\
**Instruction :**
À partir *uniquement* du texte fourni, génère une seule question pertinente en français.
Ne dépasse pas une seule question. N’ajoute aucun commentaire ni explication.
";

const QUESTION_FORMAT: &str = "
Le format de sortie doit être strictement le suivant :
**Question :** [question générée]
";

const EVALUATION_SYSTEM: &str = "\
Tu es un professeur de français expérimenté. Ton rôle est d’évaluer les réponses des élèves en te basant sur la correction orthographique, la justesse du contenu, la pertinence de la réponse, ainsi que la qualité de l’expression écrite. Sois précis, pédagogique et objectif dans tes corrections.
Réponds exactement sur trois lignes, sans rien ajouter :

Note : ?/10
Erreur : Ce qui est incorrect dans la réponse
Correction : Réponse corrigée";

const EVALUATION_INSTRUCTION: &str = "\
Corrige la réponse de l'élève uniquement à partir du texte fourni.
Évalue la réponse en termes de justesse et de pertinence.
Indique ensuite ce qui est incorrect, puis donne la version corrigée.
Ne répète pas le texte fourni.
Arrête-toi directement après la correction.
";

/// A named value a template can embed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Text,
    Focus,
    StudentAnswer,
    Question,
    ReferenceAnswer,
}

impl Slot {
    pub fn name(self) -> &'static str {
        match self {
            Slot::Text => "text",
            Slot::Focus => "focus",
            Slot::StudentAnswer => "student_answer",
            Slot::Question => "question",
            Slot::ReferenceAnswer => "reference_answer",
        }
    }
}

/// Fixed instruction template of one task
#[derive(Debug)]
pub struct PromptSpec {
    pub task: TaskKind,
    pub system: &'static str,
    /// Slots the template embeds, with whether each must be non-empty
    pub slots: &'static [(Slot, bool)],
}

static QUESTION_SPEC: PromptSpec = PromptSpec {
    task: TaskKind::GenerateQuestion,
    system: QUESTION_SYSTEM,
    slots: &[(Slot::Text, true), (Slot::Focus, false)],
};

static EVALUATION_SPEC: PromptSpec = PromptSpec {
    task: TaskKind::EvaluateAnswer,
    system: EVALUATION_SYSTEM,
    slots: &[
        (Slot::Text, true),
        (Slot::StudentAnswer, false),
        (Slot::Question, false),
        (Slot::ReferenceAnswer, false),
    ],
};

/// Values supplied by the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct Slots<'a> {
    pub text: &'a str,
    pub focus: Option<&'a str>,
    pub student_answer: Option<&'a str>,
    pub question: Option<&'a str>,
    pub reference_answer: Option<&'a str>,
}

impl<'a> Slots<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    pub fn with_focus(mut self, focus: &'a str) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn with_student_answer(mut self, answer: &'a str) -> Self {
        self.student_answer = Some(answer);
        self
    }

    pub fn with_question(mut self, question: &'a str) -> Self {
        self.question = Some(question);
        self
    }

    pub fn with_reference_answer(mut self, answer: &'a str) -> Self {
        self.reference_answer = Some(answer);
        self
    }

    fn get(&self, slot: Slot) -> Option<&'a str> {
        match slot {
            Slot::Text => Some(self.text),
            Slot::Focus => self.focus,
            Slot::StudentAnswer => self.student_answer,
            Slot::Question => self.question,
            Slot::ReferenceAnswer => self.reference_answer,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Renders task prompts
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn spec(task: TaskKind) -> &'static PromptSpec {
        match task {
            TaskKind::GenerateQuestion => &QUESTION_SPEC,
            TaskKind::EvaluateAnswer => &EVALUATION_SPEC,
        }
    }

    pub fn build(task: TaskKind, slots: &Slots<'_>) -> Result<String, PromptError> {
        let spec = Self::spec(task);
        for (slot, required) in spec.slots {
            if *required && non_blank(slots.get(*slot)).is_none() {
                return Err(PromptError::InvalidSlot {
                    task,
                    slot: slot.name(),
                });
            }
        }

        let user = match task {
            TaskKind::GenerateQuestion => Self::question_turn(slots),
            TaskKind::EvaluateAnswer => Self::evaluation_turn(slots),
        };

        let mut prompt = String::with_capacity(spec.system.len() + user.len() + 64);
        push_turn(&mut prompt, "system", spec.system);
        push_turn(&mut prompt, "user", &user);
        prompt.push_str("<|im_start|>assistant\n");
        Ok(prompt)
    }

    fn question_turn(slots: &Slots<'_>) -> String {
        let mut user = String::from(QUESTION_INSTRUCTION);
        if let Some(focus) = non_blank(slots.focus) {
            user.push_str(&format!(
                "La question doit se concentrer spécifiquement sur la partie du texte suivante : \"{focus}\"\n"
            ));
        }
        user.push_str(QUESTION_FORMAT);
        user.push_str("\n**Texte :**\n");
        user.push_str(slots.text);
        user
    }

    fn evaluation_turn(slots: &Slots<'_>) -> String {
        let answer = non_blank(slots.student_answer).unwrap_or(NO_ANSWER_SENTINEL);

        let mut user = String::from(EVALUATION_INSTRUCTION);
        user.push_str("\nTexte : ");
        user.push_str(slots.text);
        user.push('\n');
        if let Some(question) = non_blank(slots.question) {
            user.push_str(&format!("Question : {question}\n"));
        }
        if let Some(reference) = non_blank(slots.reference_answer) {
            user.push_str(&format!("Réponse attendue : {reference}\n"));
        }
        user.push_str("Réponse de l’élève : ");
        user.push_str(answer);
        user
    }
}

fn push_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|im_start|>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str("\n<|im_end|>\n");
}
