use leadflow_core::domain::conversation::ConversationState;
use leadflow_core::domain::lead::LeadField;
use leadflow_core::domain::message::Role;

use crate::calendar::{format_slot_list, CalendarSettings};
use crate::llm::ExtractionRequest;

#[derive(Clone, Debug)]
pub struct PromptSettings {
    pub agent_name: String,
    pub company_name: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self { agent_name: "María".to_string(), company_name: "Outlet Media".to_string() }
    }
}

/// System instructions for one Decide step, including a snapshot of what is
/// already known so the model never re-asks for it.
pub fn system_prompt(
    state: &ConversationState,
    prompt: &PromptSettings,
    calendar: &CalendarSettings,
) -> String {
    let min_budget = calendar.min_budget;
    let lead = &state.lead_info;
    let known = |field: LeadField, value: Option<String>| {
        format!("- {}: {}", field.as_str(), value.unwrap_or_else(|| "(pendiente)".to_string()))
    };

    let mut sections = vec![
        format!(
            "Eres {}, consultora de ventas de {}. Escribes por WhatsApp en español, en tono cercano y breve.",
            prompt.agent_name, prompt.company_name
        ),
        format!(
            "Flujo de calificación, en orden: nombre, problema, meta, presupuesto mensual, email. \
             Pregunta una cosa a la vez. Solo con todo completo y presupuesto de al menos ${min_budget} \
             al mes usa get_calendar_slots. Si el presupuesto es menor, despídete con empatía."
        ),
        "Herramientas: extract_lead_info tras cada mensaje del cliente; send_message para responder \
         (termina el turno); get_calendar_slots para ofrecer horarios; book_appointment cuando el cliente \
         elige uno de los horarios ofrecidos; update_contact en momentos clave."
            .to_string(),
        [
            "Datos conocidos del cliente:".to_string(),
            known(LeadField::Name, lead.name.clone()),
            known(LeadField::BusinessType, lead.business_type.clone()),
            known(LeadField::Problem, lead.problem.clone()),
            known(LeadField::Goal, lead.goal.clone()),
            known(LeadField::Budget, lead.budget.map(|budget| format!("${budget}/mes"))),
            known(LeadField::Email, lead.email.clone()),
        ]
        .join("\n"),
        format!("Paso actual: {}", state.current_step(min_budget).as_str()),
    ];

    if state.calendar_shown && !state.available_slots.is_empty() {
        sections.push(format!(
            "Horarios ya ofrecidos (no vuelvas a consultarlos, espera la elección):\n{}",
            format_slot_list(&state.available_slots, calendar.display_offset)
        ));
    }

    sections.join("\n\n")
}

pub const EXTRACTION_SYSTEM_PROMPT: &str =
    "You extract lead information from customer messages. Return only one valid JSON object.";

/// User prompt for one extraction call. The recent context is included so
/// short answers ("sí", "500") can be read against the question they answer.
pub fn extraction_prompt(request: &ExtractionRequest) -> String {
    let context = request
        .context
        .iter()
        .filter_map(|message| match message.role {
            Role::Customer => Some(format!("Cliente: {}", message.content)),
            Role::Assistant => Some(format!("Asistente: {}", message.content)),
            Role::Tool => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let current = serde_json::to_string(&request.current).unwrap_or_else(|_| "{}".to_string());

    let mut sections = Vec::with_capacity(4);
    if !context.is_empty() {
        sections.push(format!("Recent conversation:\n{context}"));
    }
    if let Some(question) = request.last_assistant_message.as_deref() {
        sections.push(format!("Last question asked: \"{question}\""));
    }
    sections.push(format!("Customer message: \"{}\"\nAlready known: {current}", request.message));
    sections.push(
        "Extract only NEW information stated in the customer message: name, businessType, problem, \
         goal, budget (monthly amount as a number), email. Return a JSON object such as \
         {\"name\": null, \"businessType\": null, \"problem\": null, \"goal\": null, \"budget\": null, \"email\": null}."
            .to_string(),
    );
    sections.join("\n\n")
}
