//! Local recycling knowledge for German household waste sorting.
//!
//! Everything here is a static table lookup. Unknown labels resolve to the
//! residual waste entry and the `Restmüll` bin.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    De,
}

/// Detector classes, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WasteClass {
    PaperCardboard,
    Glass,
    Recyclables,
    BioWaste,
    TextileReuse,
    Electronics,
    Battery,
    ResidualWaste,
}

impl WasteClass {
    pub const ALL: [WasteClass; 8] = [
        WasteClass::PaperCardboard,
        WasteClass::Glass,
        WasteClass::Recyclables,
        WasteClass::BioWaste,
        WasteClass::TextileReuse,
        WasteClass::Electronics,
        WasteClass::Battery,
        WasteClass::ResidualWaste,
    ];

    pub fn from_class_id(class_id: u32) -> Option<Self> {
        Self::ALL.get(class_id as usize).copied()
    }

    /// Accepts the model label with underscores or spaces, in any case.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(' ', "_");
        Self::ALL.into_iter().find(|c| c.label() == normalized)
    }

    pub fn class_id(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            WasteClass::PaperCardboard => "paper_cardboard",
            WasteClass::Glass => "glass",
            WasteClass::Recyclables => "recyclables",
            WasteClass::BioWaste => "bio_waste",
            WasteClass::TextileReuse => "textile_reuse",
            WasteClass::Electronics => "electronics",
            WasteClass::Battery => "battery",
            WasteClass::ResidualWaste => "residual_waste",
        }
    }

    pub fn display_name(self) -> String {
        self.label().replace('_', " ")
    }

    pub fn bin(self) -> GermanBin {
        match self {
            WasteClass::PaperCardboard => GermanBin::Papiertonne,
            WasteClass::Glass => GermanBin::Glascontainer,
            WasteClass::Recyclables => GermanBin::GelberSack,
            WasteClass::BioWaste => GermanBin::Biotonne,
            WasteClass::TextileReuse => GermanBin::Textilcontainer,
            WasteClass::Electronics | WasteClass::Battery => GermanBin::Sondermuell,
            WasteClass::ResidualWaste => GermanBin::Restmuell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GermanBin {
    Papiertonne,
    Glascontainer,
    #[serde(rename = "Gelber Sack / Gelbe Tonne")]
    GelberSack,
    Biotonne,
    Textilcontainer,
    #[serde(rename = "Sondermüll")]
    Sondermuell,
    #[serde(rename = "Restmüll")]
    Restmuell,
}

impl GermanBin {
    pub fn name(self) -> &'static str {
        match self {
            GermanBin::Papiertonne => "Papiertonne",
            GermanBin::Glascontainer => "Glascontainer",
            GermanBin::GelberSack => "Gelber Sack / Gelbe Tonne",
            GermanBin::Biotonne => "Biotonne",
            GermanBin::Textilcontainer => "Textilcontainer",
            GermanBin::Sondermuell => "Sondermüll",
            GermanBin::Restmuell => "Restmüll",
        }
    }
}

impl std::fmt::Display for GermanBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Disposal guidance for one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecyclingInfo {
    pub class: WasteClass,
    pub bin: GermanBin,
    pub short: &'static str,
    pub instructions: &'static [&'static str],
    pub caution: Option<&'static str>,
    pub reuse_ideas: &'static [&'static str],
    pub environmental_impact: Option<&'static str>,
    pub common_mistakes: &'static [&'static str],
    /// False when the label was not found and the residual default was used.
    pub recognized: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecyclingKnowledgeMapper {
    language: Language,
}

impl RecyclingKnowledgeMapper {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn classify(&self, label: &str) -> RecyclingInfo {
        match WasteClass::from_label(label) {
            Some(class) => self.info(class, true),
            None => self.info(WasteClass::ResidualWaste, false),
        }
    }

    pub fn classify_id(&self, class_id: u32) -> RecyclingInfo {
        match WasteClass::from_class_id(class_id) {
            Some(class) => self.info(class, true),
            None => self.info(WasteClass::ResidualWaste, false),
        }
    }

    fn info(&self, class: WasteClass, recognized: bool) -> RecyclingInfo {
        let en = entry(class, Language::En);
        let local = entry(class, self.language);

        // German entries omit some lists; fall back to English for those
        RecyclingInfo {
            class,
            bin: class.bin(),
            short: local.short,
            instructions: local.steps,
            caution: local.caution.or(en.caution),
            reuse_ideas: non_empty(local.reuse_ideas, en.reuse_ideas),
            environmental_impact: local.environmental_impact.or(en.environmental_impact),
            common_mistakes: non_empty(local.common_mistakes, en.common_mistakes),
            recognized,
        }
    }
}

fn non_empty(
    primary: &'static [&'static str],
    fallback: &'static [&'static str],
) -> &'static [&'static str] {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}

struct Entry {
    short: &'static str,
    steps: &'static [&'static str],
    caution: Option<&'static str>,
    reuse_ideas: &'static [&'static str],
    environmental_impact: Option<&'static str>,
    common_mistakes: &'static [&'static str],
}

fn entry(class: WasteClass, language: Language) -> &'static Entry {
    let table = match language {
        Language::En => &EN,
        Language::De => &DE,
    };
    &table[class as usize]
}

static EN: [Entry; 8] = [
    Entry {
        short: "Keep dry & clean. Flatten cardboard boxes. Remove plastic windows.",
        steps: &[
            "Remove plastic windows from envelopes and packaging.",
            "Flatten cardboard boxes to save space.",
            "Keep paper dry, wet paper cannot be recycled.",
            "Remove heavily soiled paper (e.g., greasy pizza boxes).",
            "Newspapers, magazines, office paper, and cardboard are all recyclable.",
            "Stack items neatly in the paper bin.",
        ],
        caution: Some("Do not include waxed paper, thermal receipts, or contaminated paper."),
        reuse_ideas: &[
            "Use as packing material",
            "Create crafts or origami",
            "Compost shredded paper",
            "Use for seed starting pots",
        ],
        environmental_impact: Some("Recycling paper saves trees and reduces water usage by 50%"),
        common_mistakes: &[
            "Including wet or moldy paper",
            "Mixing in plastic-coated materials",
            "Not flattening cardboard boxes",
        ],
    },
    Entry {
        short: "Rinse containers. Separate by color if required. Remove metal lids.",
        steps: &[
            "Rinse containers to remove residue.",
            "Separate glass by color (white, green, brown) if local system requires.",
            "Remove metal or plastic lids and caps.",
            "Labels can usually remain on containers.",
            "Only packaging glass, no windows, mirrors, or ceramics.",
            "Place in designated glass container.",
        ],
        caution: Some("Broken glass, ceramics, and Pyrex damage recycling equipment."),
        reuse_ideas: &[
            "Use jars for storage containers",
            "Create decorative items",
            "Use bottles for planters",
            "Make candle holders",
        ],
        environmental_impact: Some("Glass can be recycled infinitely without quality loss"),
        common_mistakes: &[
            "Including ceramics or porcelain",
            "Not removing metal lids",
            "Mixing different colored glass",
        ],
    },
    Entry {
        short: "Packaging with Green Dot symbol. Rinse and flatten. Metal and plastic together.",
        steps: &[
            "Look for the Green Dot (Der Grüne Punkt) symbol on packaging.",
            "Include plastic packaging, yogurt containers, metal cans, and composite materials.",
            "Rinse to remove food residue, dry packaging is best.",
            "Flatten packaging to save space in yellow bag/bin.",
            "Caps and lids can stay on bottles.",
            "Place all recyclables in yellow bag or bin together.",
        ],
        caution: Some(
            "Do not include non-packaging items like toys, hangers, or household goods. Use residual waste.",
        ),
        reuse_ideas: &[
            "Use plastic containers for storage",
            "Create garden tools from cans",
            "Make crafts from bottle caps",
            "Reuse packaging for organization",
        ],
        environmental_impact: Some("Recycling plastic reduces fossil fuel usage and landfill waste"),
        common_mistakes: &[
            "Including non-packaging plastics",
            "Not rinsing containers",
            "Mixing with organic waste",
        ],
    },
    Entry {
        short: "Food scraps, garden waste. No plastic bags. Keep lid closed.",
        steps: &[
            "Include fruit/vegetable scraps, coffee grounds, tea bags, and garden waste.",
            "Use compostable bags or newspaper to line bin.",
            "No cooked food, meat, or dairy if local system prohibits.",
            "Chop large pieces to speed decomposition.",
            "Keep bin closed to prevent odors and pests.",
            "Empty regularly to avoid fruit flies.",
        ],
        caution: Some("Never use plastic bags, only certified compostable bags or paper."),
        reuse_ideas: &[
            "Create nutrient-rich compost for gardens",
            "Use as natural fertilizer",
            "Feed to compost worms",
            "Create mulch for plants",
        ],
        environmental_impact: Some(
            "Organic waste composting reduces methane emissions from landfills",
        ),
        common_mistakes: &[
            "Using regular plastic bags",
            "Including meat or dairy",
            "Not chopping large items",
            "Leaving bin open",
        ],
    },
    Entry {
        short: "Clean, dry clothing and textiles. Donate wearable items to charity.",
        steps: &[
            "Wash and dry items before disposal.",
            "Wearable clothing: Donate to charity shops or textile collection containers.",
            "Damaged textiles: Use designated textile recycling bins.",
            "Tie shoes together in pairs.",
            "Use closed bags to keep items dry.",
            "Remove accessories like belts or buttons.",
        ],
        caution: Some("Wet or moldy textiles cannot be recycled. Dispose in residual waste."),
        reuse_ideas: &[
            "Donate to charity organizations",
            "Use for rags or cleaning cloths",
            "Create patchwork quilts",
            "Repurpose into tote bags",
        ],
        environmental_impact: Some("Textile recycling reduces textile waste in landfills by 95%"),
        common_mistakes: &[
            "Including wet or dirty clothes",
            "Not tying shoes together",
            "Mixing with regular waste",
        ],
    },
    Entry {
        short: "E-waste collection at Recyclinghof or retailer take-back. Remove batteries first.",
        steps: &[
            "Remove batteries and dispose separately.",
            "Delete personal data from devices.",
            "Retailers must take back old devices when buying new ones (free of charge).",
            "Large items: Bring to Recyclinghof (recycling center).",
            "Small items: Some retailers have in-store collection boxes.",
            "Check for special collection events.",
        ],
        caution: Some("Never dispose in residual waste. Contains hazardous materials."),
        reuse_ideas: &[
            "Donate working devices to schools",
            "Sell or trade functional electronics",
            "Use components for repairs",
            "Repurpose for educational projects",
        ],
        environmental_impact: Some(
            "Proper e-waste recycling recovers valuable metals and prevents toxic leaching",
        ),
        common_mistakes: &[
            "Not removing batteries first",
            "Including in regular household waste",
            "Not wiping personal data",
        ],
    },
    Entry {
        short: "Collection boxes at retailers and Recyclinghof. Tape lithium battery terminals.",
        steps: &[
            "Tape terminals of lithium batteries to prevent fires.",
            "Return to collection boxes at supermarkets, drugstores, or electronics retailers.",
            "All retailers selling batteries must take them back (free of charge).",
            "Bring to Recyclinghof for large quantities.",
            "Separate different battery types when possible.",
        ],
        caution: Some("Damaged batteries can cause fires. Handle with care and store separately."),
        reuse_ideas: &[
            "Rechargeable batteries can be reused",
            "Use for low-power devices",
            "Donate working batteries",
        ],
        environmental_impact: Some(
            "Battery recycling prevents heavy metal contamination of soil and water",
        ),
        common_mistakes: &[
            "Not taping battery terminals",
            "Mixing with regular waste",
            "Including damaged batteries carelessly",
        ],
    },
    Entry {
        short: "Non-recyclable waste. Last resort after sorting recyclables.",
        steps: &[
            "Use for items that cannot be recycled or composted.",
            "Examples: heavily soiled items, non-packaging plastics, broken ceramics.",
            "Minimize residual waste by properly sorting recyclables.",
            "Close bags tightly to prevent odors.",
            "Check local guidelines for special items.",
        ],
        caution: Some("Reducing residual waste helps the environment and lowers waste fees."),
        reuse_ideas: &[
            "Avoid creating residual waste through better sorting",
            "Use reusable alternatives",
            "Repair items instead of discarding",
        ],
        environmental_impact: Some(
            "Minimizing residual waste reduces landfill usage and incineration",
        ),
        common_mistakes: &[
            "Including recyclable materials",
            "Not using proper bags",
            "Mixing hazardous materials",
        ],
    },
];

static DE: [Entry; 8] = [
    Entry {
        short: "Trocken & sauber halten. Kartons flach drücken. Plastikfenster entfernen.",
        steps: &[
            "Plastikfenster von Briefumschlägen und Verpackungen entfernen.",
            "Kartons flach drücken, um Platz zu sparen.",
            "Papier trocken halten, nasses Papier kann nicht recycelt werden.",
            "Stark verschmutztes Papier entfernen (z.B. fettige Pizzakartons).",
            "Zeitungen, Zeitschriften, Büropapier und Kartons sind recycelbar.",
            "Artikel ordentlich in der Papiertonne stapeln.",
        ],
        caution: Some("Kein Wachspapier, Thermopapier-Belege oder kontaminiertes Papier."),
        reuse_ideas: &[
            "Als Verpackungsmaterial verwenden",
            "Kunsthandwerk oder Origami basteln",
            "Zerrissenes Papier kompostieren",
            "Für Anzuchttöpfe verwenden",
        ],
        environmental_impact: Some(
            "Papierrecycling spart Bäume und reduziert Wasserverbrauch um 50%",
        ),
        common_mistakes: &[
            "Nasses oder schimmeliges Papier einwerfen",
            "Kunststoffbeschichtete Materialien beimischen",
            "Kartons nicht flach drücken",
        ],
    },
    Entry {
        short: "Behälter ausspülen. Nach Farbe trennen. Metalldeckel entfernen.",
        steps: &[
            "Behälter ausspülen, um Rückstände zu entfernen.",
            "Glas nach Farbe trennen (weiß, grün, braun) wenn lokal erforderlich.",
            "Metall- oder Plastikdeckel und -kappen entfernen.",
            "Etiketten können meist auf Behältern bleiben.",
            "Nur Verpackungsglas, keine Fenster, Spiegel oder Keramik.",
        ],
        caution: Some("Glasbruch, Keramik und Pyrex beschädigen Recyclinganlagen."),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "Verpackungen mit Grünem Punkt. Ausspülen und flach drücken. Metall und Plastik zusammen.",
        steps: &[
            "Nach dem Grünen Punkt Symbol auf Verpackungen suchen.",
            "Plastikverpackungen, Joghurtbecher, Metalldosen und Verbundmaterialien gehören dazu.",
            "Ausspülen, um Essensreste zu entfernen. Trockene Verpackung ist am besten.",
            "Verpackungen flach drücken, um Platz im Gelben Sack/Tonne zu sparen.",
            "Verschlüsse und Deckel können auf Flaschen bleiben.",
        ],
        caution: Some(
            "Keine Nicht-Verpackungen wie Spielzeug, Kleiderbügel oder Haushaltswaren. Diese gehören in den Restmüll.",
        ),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "Essensreste, Gartenabfälle. Keine Plastiktüten. Deckel geschlossen halten.",
        steps: &[
            "Obst-/Gemüsereste, Kaffeesatz, Teebeutel und Gartenabfälle gehören dazu.",
            "Kompostierbare Tüten oder Zeitungspapier zum Auskleiden verwenden.",
            "Kein gekochtes Essen, Fleisch oder Milchprodukte, wenn lokal verboten.",
            "Große Stücke zerkleinern, um Zersetzung zu beschleunigen.",
            "Tonne geschlossen halten, um Gerüche und Schädlinge zu vermeiden.",
        ],
        caution: Some(
            "Niemals Plastiktüten verwenden, nur zertifizierte kompostierbare Tüten oder Papier.",
        ),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "Saubere, trockene Kleidung und Textilien. Tragbare Artikel spenden.",
        steps: &[
            "Artikel vor Entsorgung waschen und trocknen.",
            "Tragbare Kleidung: An Wohltätigkeitsläden oder Altkleidercontainer spenden.",
            "Beschädigte Textilien: Spezielle Textil-Recyclingbehälter nutzen.",
            "Schuhe paarweise zusammenbinden.",
            "Geschlossene Tüten verwenden, um Artikel trocken zu halten.",
        ],
        caution: Some(
            "Nasse oder schimmelige Textilien können nicht recycelt werden. Diese gehören in den Restmüll.",
        ),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "E-Schrott am Recyclinghof oder Händler-Rücknahme. Batterien vorher entfernen.",
        steps: &[
            "Batterien entfernen und separat entsorgen.",
            "Persönliche Daten von Geräten löschen.",
            "Händler müssen alte Geräte beim Neukauf zurücknehmen (kostenlos).",
            "Große Geräte: Zum Recyclinghof bringen.",
            "Kleine Geräte: Manche Händler haben Sammelboxen im Laden.",
        ],
        caution: Some("Niemals im Restmüll entsorgen. Enthält gefährliche Materialien."),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "Sammelboxen bei Händlern und Recyclinghof. Lithiumbatterien abkleben.",
        steps: &[
            "Pole von Lithiumbatterien abkleben, um Brände zu vermeiden.",
            "In Sammelboxen bei Supermärkten, Drogerien oder Elektronikhändlern zurückgeben.",
            "Alle Händler, die Batterien verkaufen, müssen sie zurücknehmen (kostenlos).",
            "Bei großen Mengen zum Recyclinghof bringen.",
        ],
        caution: Some(
            "Beschädigte Batterien können Brände verursachen. Vorsichtig handhaben und separat lagern.",
        ),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
    Entry {
        short: "Nicht-recycelbarer Abfall. Letzte Option nach Sortierung der Wertstoffe.",
        steps: &[
            "Für Artikel verwenden, die nicht recycelt oder kompostiert werden können.",
            "Beispiele: stark verschmutzte Artikel, Nicht-Verpackungsplastik, zerbrochene Keramik.",
            "Restmüll minimieren durch korrekte Sortierung der Wertstoffe.",
            "Tüten fest verschließen, um Gerüche zu vermeiden.",
        ],
        caution: Some("Reduzierung des Restmülls schont die Umwelt und senkt Abfallgebühren."),
        reuse_ideas: &[],
        environmental_impact: None,
        common_mistakes: &[],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_order_matches_model_output() {
        for (id, class) in WasteClass::ALL.iter().enumerate() {
            assert_eq!(class.class_id(), id as u32);
            assert_eq!(WasteClass::from_class_id(id as u32), Some(*class));
        }
        assert_eq!(WasteClass::from_class_id(8), None);
    }

    #[test]
    fn test_bin_mapping() {
        let mapper = RecyclingKnowledgeMapper::default();
        let bins: Vec<&str> = WasteClass::ALL
            .iter()
            .map(|c| mapper.classify(c.label()).bin.name())
            .collect();
        assert_eq!(
            bins,
            vec![
                "Papiertonne",
                "Glascontainer",
                "Gelber Sack / Gelbe Tonne",
                "Biotonne",
                "Textilcontainer",
                "Sondermüll",
                "Sondermüll",
                "Restmüll",
            ]
        );
    }

    #[test]
    fn test_label_parsing_accepts_spaces_and_case() {
        assert_eq!(WasteClass::from_label("bio waste"), Some(WasteClass::BioWaste));
        assert_eq!(WasteClass::from_label(" Paper_Cardboard "), Some(WasteClass::PaperCardboard));
        assert_eq!(WasteClass::BioWaste.display_name(), "bio waste");
    }

    #[test]
    fn test_unknown_label_falls_back_to_residual() {
        let info = RecyclingKnowledgeMapper::default().classify("spaceship");
        assert_eq!(info.class, WasteClass::ResidualWaste);
        assert_eq!(info.bin, GermanBin::Restmuell);
        assert!(!info.recognized);
        assert!(!info.instructions.is_empty());

        let by_id = RecyclingKnowledgeMapper::default().classify_id(99);
        assert_eq!(by_id.bin, GermanBin::Restmuell);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let mapper = RecyclingKnowledgeMapper::new(Language::En);
        assert_eq!(mapper.classify("glass"), mapper.classify("glass"));
    }

    #[test]
    fn test_german_content_with_english_fallback() {
        let info = RecyclingKnowledgeMapper::new(Language::De).classify("glass");
        assert!(info.short.starts_with("Behälter"));
        assert_eq!(info.reuse_ideas[0], "Use jars for storage containers");

        let paper = RecyclingKnowledgeMapper::new(Language::De).classify("paper_cardboard");
        assert_eq!(paper.reuse_ideas[0], "Als Verpackungsmaterial verwenden");
    }

    #[test]
    fn test_every_class_has_content() {
        for language in [Language::En, Language::De] {
            let mapper = RecyclingKnowledgeMapper::new(language);
            for class in WasteClass::ALL {
                let info = mapper.classify(class.label());
                assert!(info.recognized);
                assert!(!info.short.is_empty());
                assert!(!info.instructions.is_empty());
                assert!(info.caution.is_some());
                assert!(!info.reuse_ideas.is_empty());
            }
        }
    }

    #[test]
    fn test_bin_serializes_with_german_name() {
        assert_eq!(
            serde_json::to_string(&GermanBin::Sondermuell).unwrap(),
            "\"Sondermüll\""
        );
    }
}
