//! Intent classification (spec.md §4.6 step 4). Deliberately small: the
//! orchestrator only needs to know whether to short-circuit RAG, not to
//! understand the question. Non-goal per spec.md §1: "does not guarantee
//! textual correctness of answers" extends to intent classification too —
//! this is a cheap keyword gate, not an NLU model.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    TourControl,
    Question,
}

const GREETING_WORDS: &[&str] = &["你好", "hello", "hi", "hey", "您好"];
const TOUR_CONTROL_WORDS: &[&str] = &[
    "下一个", "下一站", "next stop", "上一个", "暂停", "pause", "继续", "resume", "结束", "stop tour",
];

pub fn classify(text: &str) -> Intent {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return Intent::Question;
    }
    if TOUR_CONTROL_WORDS.iter().any(|w| lower.contains(w)) {
        return Intent::TourControl;
    }
    if GREETING_WORDS.iter().any(|w| lower.contains(w)) && lower.len() <= 20 {
        return Intent::Greeting;
    }
    Intent::Question
}

/// Templated reply for a short-circuited intent (spec.md §4.6 step 4:
/// "Greetings and tour_control short-circuit RAG and go straight to
/// templated responses").
pub fn templated_reply(intent: Intent) -> &'static str {
    match intent {
        Intent::Greeting => "你好，欢迎参观",
        Intent::TourControl => "好的",
        Intent::Question => unreachable!("templated_reply only applies to short-circuited intents"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_greeting() {
        assert_eq!(classify("你好"), Intent::Greeting);
        assert_eq!(classify("hello there"), Intent::Greeting);
    }

    #[test]
    fn classifies_tour_control() {
        assert_eq!(classify("下一站"), Intent::TourControl);
        assert_eq!(classify("please pause"), Intent::TourControl);
    }

    #[test]
    fn classifies_question_by_default() {
        assert_eq!(classify("这是什么材料?"), Intent::Question);
        assert_eq!(classify("What year was this built?"), Intent::Question);
    }
}
