//! System prompt for the decision oracle

use std::fmt::Write;

use crate::memory::SessionSnapshot;
use crate::types::{AgentId, ChatConfig};

/// Turns of history shown to the oracle
pub const HISTORY_WINDOW: usize = 5;

/// Renders the oracle's system prompt. Pure; no I/O.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, config: &ChatConfig, session: &SessionSnapshot, context: Option<&str>) -> String;
}

/// Spanish routing prompt with per-tenant persona and session history
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptBuilder;

fn or_default<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, config: &ChatConfig, session: &SessionSnapshot, context: Option<&str>) -> String {
        let bot_name = or_default(&config.bot_name, "Asistente");
        let goal = or_default(&config.goal, "ayudar a los clientes");
        let personality = or_default(&config.personality, "amable y profesional");
        let greeting = or_default(&config.greeting, "¡Hola! ¿En qué puedo ayudarte?");
        let farewell = or_default(&config.farewell, "¡Gracias por contactarnos!");
        let unknown = or_default(
            &config.unknown_answer,
            "No tengo esa información; permíteme transferirte con un agente.",
        );
        let escalation = or_default(
            &config.escalation,
            "Te voy a comunicar con un agente para ayudarte mejor.",
        );
        let service_agent = config.modality_agent().unwrap_or(AgentId::Cita);

        let mut prompt = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(
            prompt,
            "Eres {bot_name}, un asistente {personality}. Tu objetivo principal es {goal}."
        );
        let _ = writeln!(
            prompt,
            "\nDecide en cada mensaje si respondes tú directamente (action = \"respond\") \
             o si derivas a un agente especializado (action = \"delegate\")."
        );
        let _ = writeln!(prompt, "\nAgentes disponibles:");
        let _ = writeln!(prompt, "- reserva: reservas de mesa o espacio");
        let _ = writeln!(
            prompt,
            "- {key}: {key}s del negocio (el servicio principal de este negocio)",
            key = service_agent.as_str()
        );
        let _ = writeln!(
            prompt,
            "\nResponde tú saludos, despedidas y preguntas generales sobre el negocio. \
             Deriva cuando el usuario quiera reservar o avanzar con {}s.",
            service_agent.as_str()
        );
        let _ = writeln!(prompt, "Al delegar, agent_name debe ser el agente elegido; al responder, agent_name es null.");

        let _ = writeln!(prompt, "\nFrases del negocio:");
        let _ = writeln!(prompt, "- Saludo: {greeting}");
        let _ = writeln!(prompt, "- Despedida: {farewell}");
        let _ = writeln!(prompt, "- Cuando no sabes: {unknown}");
        let _ = writeln!(prompt, "- Escalamiento: {escalation}");

        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            let _ = writeln!(prompt, "\nInformación del negocio:\n{context}");
        }

        if !session.turns.is_empty() {
            let _ = writeln!(prompt, "\nHistorial reciente de la conversación:");
            let start = session.turns.len().saturating_sub(HISTORY_WINDOW);
            for turn in &session.turns[start..] {
                let marker = match turn.agent_used {
                    Some(agent) => format!("(derivaste a: {agent})"),
                    None => "(respondiste directo)".to_string(),
                };
                let _ = writeln!(prompt, "- Usuario: \"{}\"", turn.user_message);
                let _ = writeln!(prompt, "  Respondiste: \"{}\" {marker}", turn.response);
            }
        }

        if let Some(agent) = session.current_agent {
            let _ = writeln!(
                prompt,
                "\nLa conversación está en curso con el agente {agent}. Si el usuario continúa \
                 ese mismo tema, vuelve a delegar a {agent}."
            );
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Turn;

    fn session(turns: Vec<Turn>) -> SessionSnapshot {
        let current_agent = turns.iter().rev().find_map(|t| t.agent_used);
        SessionSnapshot {
            turns,
            current_agent,
        }
    }

    #[test]
    fn test_defaults_applied() {
        let prompt = DefaultPromptBuilder.build(&ChatConfig::for_tenant(1), &session(vec![]), None);
        assert!(prompt.contains("Eres Asistente"));
        assert!(prompt.contains("- cita: citas del negocio"));
        assert!(!prompt.contains("Historial"));
        assert!(!prompt.contains("Información del negocio"));
    }

    #[test]
    fn test_config_and_context() {
        let config = ChatConfig {
            bot_name: Some("Luna".into()),
            greeting: Some("  ".into()),
            modality: Some("Ventas".into()),
            ..ChatConfig::for_tenant(1)
        };
        let prompt = DefaultPromptBuilder.build(&config, &session(vec![]), Some("Pizzería en Cusco"));
        assert!(prompt.contains("Eres Luna"));
        assert!(prompt.contains("¡Hola! ¿En qué puedo ayudarte?"));
        assert!(prompt.contains("- venta: ventas del negocio"));
        assert!(prompt.contains("Información del negocio:\nPizzería en Cusco"));
    }

    #[test]
    fn test_history_window_and_hint() {
        let mut turns: Vec<Turn> = (0..7)
            .map(|i| Turn::new(format!("msg-{i}"), None, format!("resp-{i}")))
            .collect();
        turns.push(Turn::new("mesa para 4", Some(AgentId::Reserva), "¿A qué hora?"));

        let prompt = DefaultPromptBuilder.build(&ChatConfig::for_tenant(1), &session(turns), None);
        assert!(!prompt.contains("msg-2\""));
        assert!(prompt.contains("- Usuario: \"msg-3\""));
        assert!(prompt.contains("\"resp-6\" (respondiste directo)"));
        assert!(prompt.contains("\"¿A qué hora?\" (derivaste a: reserva)"));
        assert!(prompt.contains("en curso con el agente reserva"));
    }
}
