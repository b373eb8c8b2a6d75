use serde::Serialize;

/// Tagged persona facets. Content generation lives upstream; the gateway
/// only selects and reports the tags plus the rendering template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Archetype {
    Sage,
    Trickster,
    Guardian,
    Oracle,
    Wanderer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Era {
    Ancient,
    Classical,
    Industrial,
    Digital,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Element {
    Fire,
    Water,
    Earth,
    Air,
}

#[derive(Debug, Clone, Serialize)]
pub struct Persona {
    pub archetype: Archetype,
    pub era: Era,
    pub element: Element,
    pub beauvoir_template: String,
}

pub trait PersonaSource: Send + Sync {
    /// None for an unknown personality (surfaces as 404).
    fn persona_for(&self, token_id: &str) -> Option<Persona>;
}

/// Deterministic catalog: a token id maps to the same persona forever.
pub struct CatalogPersonaSource;

const ARCHETYPES: [Archetype; 5] = [
    Archetype::Sage,
    Archetype::Trickster,
    Archetype::Guardian,
    Archetype::Oracle,
    Archetype::Wanderer,
];
const ERAS: [Era; 4] = [Era::Ancient, Era::Classical, Era::Industrial, Era::Digital];
const ELEMENTS: [Element; 4] = [Element::Fire, Element::Water, Element::Earth, Element::Air];

impl PersonaSource for CatalogPersonaSource {
    fn persona_for(&self, token_id: &str) -> Option<Persona> {
        let id: u64 = token_id.parse().ok()?;
        let archetype = ARCHETYPES[(id % ARCHETYPES.len() as u64) as usize];
        let era = ERAS[((id / 5) % ERAS.len() as u64) as usize];
        let element = ELEMENTS[((id / 20) % ELEMENTS.len() as u64) as usize];
        Some(Persona {
            archetype,
            era,
            element,
            beauvoir_template: format!(
                "You are a {:?} of the {:?} era, attuned to {:?}.",
                archetype, era, element
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_deterministic() {
        let source = CatalogPersonaSource;
        let a = source.persona_for("42").unwrap();
        let b = source.persona_for("42").unwrap();
        assert_eq!(a.archetype, b.archetype);
        assert_eq!(a.era, b.era);
        assert_eq!(a.element, b.element);
    }

    #[test]
    fn unknown_token_ids_have_no_persona() {
        let source = CatalogPersonaSource;
        assert!(source.persona_for("not-a-number").is_none());
    }
}
