use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::domain::conversation::ConversationState;
use crate::domain::message::normalize_message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CannedKind {
    Greeting,
    Closing,
    Rejection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CannedReply {
    pub kind: CannedKind,
    pub text: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResponseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Fixed replies for low-information inputs. A hit bypasses the orchestrator.
pub struct ResponseCache {
    greetings: HashMap<&'static str, String>,
    closings: HashMap<&'static str, String>,
    rejections: HashMap<&'static str, String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(agent_name: &str, company_name: &str) -> Self {
        let intro = format!(
            "¡Hola! Soy {agent_name}, tu consultora de ventas de {company_name}. ¿Podrías decirme tu nombre, por favor?"
        );
        let short_intro = format!("¡Hola! Soy {agent_name} de {company_name}. ¿Cómo te llamas?");
        let morning = format!("¡Buenos días! Soy {agent_name} de {company_name}. ¿Cómo te llamas?");

        let greetings = HashMap::from([
            ("hola", intro.clone()),
            ("hi", intro),
            ("buenos dias", morning.clone()),
            ("buenos días", morning),
            (
                "buenas tardes",
                format!("¡Buenas tardes! Soy {agent_name} de {company_name}. ¿Cuál es tu nombre?"),
            ),
            (
                "buenas noches",
                format!(
                    "¡Buenas noches! Soy {agent_name} de {company_name}. ¿Me podrías compartir tu nombre?"
                ),
            ),
            ("hello", short_intro.clone()),
            ("hey", short_intro.clone()),
            ("que tal", short_intro.clone()),
            ("qué tal", short_intro),
        ]);

        let thanks = "¡De nada! ¿Hay algo más en lo que pueda ayudarte con tu negocio?".to_string();
        let ack = "Perfecto. ¿Tienes alguna pregunta sobre cómo podemos ayudar a tu negocio?"
            .to_string();
        let farewell =
            "¡Hasta luego! Si necesitas ayuda con tu negocio, aquí estaré. ¡Mucho éxito!".to_string();
        let closings = HashMap::from([
            ("gracias", thanks.clone()),
            ("thanks", thanks),
            ("ok", ack.clone()),
            ("okay", ack),
            ("vale", "Excelente. ¿En qué más puedo ayudarte?".to_string()),
            ("adios", farewell.clone()),
            ("adiós", farewell.clone()),
            ("bye", farewell.clone()),
            ("chao", farewell),
            (
                "hasta luego",
                "¡Hasta pronto! Cuando estés listo para hacer crecer tu negocio, contáctame. ¡Éxito!"
                    .to_string(),
            ),
        ]);

        let no_thanks = "No hay problema. Si en el futuro necesitas ayuda para atraer más clientes, no dudes en contactarme. ¡Éxito!".to_string();
        let later =
            "Claro, sin presión. Guarda mi contacto para cuando estés listo. ¡Éxito con tu negocio!"
                .to_string();
        let rejections = HashMap::from([
            (
                "no me interesa",
                "Entiendo perfectamente. Si cambias de opinión o tienes preguntas sobre marketing digital, aquí estaré. ¡Mucho éxito con tu negocio!".to_string(),
            ),
            ("no gracias", no_thanks.clone()),
            ("no thanks", no_thanks),
            (
                "ahora no",
                "Perfecto, entiendo. Cuando sea el momento adecuado para ti, aquí estaré. ¡Mucho éxito!"
                    .to_string(),
            ),
            ("tal vez despues", later.clone()),
            ("tal vez después", later),
        ]);

        Self {
            greetings,
            closings,
            rejections,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, message: &str, state: &ConversationState) -> Option<CannedReply> {
        let reply = self.find(message, state);
        let counter = if reply.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        reply
    }

    fn find(&self, message: &str, state: &ConversationState) -> Option<CannedReply> {
        // Mid-scheduling input is always a selection or a question about it.
        if state.calendar_shown || state.appointment_booked {
            return None;
        }

        let normalized = normalize_message(message);
        // A bare yes/no answers whatever was just asked.
        if matches!(normalized.as_str(), "no" | "si" | "sí") {
            return None;
        }

        if state.lead_info.name.is_none() {
            if let Some(text) = self.greetings.get(normalized.as_str()) {
                return Some(CannedReply { kind: CannedKind::Greeting, text: text.clone() });
            }
        }
        if let Some(text) = self.closings.get(normalized.as_str()) {
            return Some(CannedReply { kind: CannedKind::Closing, text: text.clone() });
        }
        self.rejections
            .get(normalized.as_str())
            .map(|text| CannedReply { kind: CannedKind::Rejection, text: text.clone() })
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.greetings.len() + self.closings.len() + self.rejections.len(),
        }
    }
}
