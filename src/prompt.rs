//! Instruction prompt construction.
//!
//! The upstream model is an instruction-tuned Llama 3 variant, so the prompt
//! uses its role-delimited header tokens: a fixed system turn, a user turn
//! carrying the retrieved context and the question, and an open assistant
//! turn for the model to complete.

const CONTEXT_PLACEHOLDER: &str = "{context}";
const QUERY_PLACEHOLDER: &str = "{user_query}";

const PROMPT_TEMPLATE: &str = "<|begin_of_text|><|start_header_id|>system<|end_header_id|>

You are a helpful, respectful, and honest assistant. Always answer as helpfully as possible, while being safe. Be brief in your answers. Your answers should not include any harmful, unethical, racist, sexist, toxic, dangerous, or illegal content. Please ensure that your responses are socially unbiased and positive in nature. If a question does not make any sense, or is not factually coherent, explain why instead of answering something not correct. If you don't know the answer to a question, please do not share false information. Generate the next agent response by answering the question. You are provided several documents with titles. Answer with no more than 150 words. Answer in full sentences. If you cannot base your answer on the given document, please state that you do not have an answer.<|eot_id|><|start_header_id|>user<|end_header_id|>

{context}

{user_query} Answer with no more than 150 words. If you cannot base your answer on the given document, please state that you do not have an answer. Do not mention the \"document\" or pages in your answer.<|eot_id|><|start_header_id|>assistant<|end_header_id|>";

/// Fill the instruction template with `context` and `query`.
///
/// Substitution is single pass over the template: text coming from either
/// argument is never rescanned, so a query containing `{context}` (or a
/// context containing `{user_query}`) is copied through literally. Context
/// is placed first because it precedes the question in the template.
pub fn build_prompt(query: &str, context: &str) -> String {
    let (head, rest) = PROMPT_TEMPLATE
        .split_once(CONTEXT_PLACEHOLDER)
        .unwrap_or((PROMPT_TEMPLATE, ""));
    let (middle, tail) = rest.split_once(QUERY_PLACEHOLDER).unwrap_or((rest, ""));

    let mut prompt =
        String::with_capacity(head.len() + context.len() + middle.len() + query.len() + tail.len());
    prompt.push_str(head);
    prompt.push_str(context);
    prompt.push_str(middle);
    prompt.push_str(query);
    prompt.push_str(tail);
    prompt
}

/// Retrieved context for a query.
///
/// Retrieval is not wired in yet; every prompt gets an empty context.
pub fn build_context(_query: &str) -> String {
    String::new()
}
