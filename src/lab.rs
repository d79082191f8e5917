//! Demo laboratory schema: experimenters and their groups, subjects with
//! fish genotypes, stocks and crosses, equipment and recordings.

use crate::core::{Result, Row, Value};
use crate::declare::declare;
use crate::schema::AdapterRegistry;
use crate::storage::{Database, Tier};
use tracing::info;

const COMMENTS: &str = "comments = null : varchar(4000)";

/// `(name, tier, definition)` in declaration order.
fn tables() -> Vec<(&'static str, Tier, String)> {
    vec![
        (
            "core.DataType",
            Tier::Manual,
            "data_type : <lookupname> # type of data, e.g. numpy.array\n\
             ---\n\
             description = null : varchar(4000)"
                .to_string(),
        ),
        (
            "experimenters.Experimenter",
            Tier::Manual,
            "experimenter : varchar(31) # short user name\n\
             ---\n\
             experimenter_initials : char(3)\n\
             first_name : varchar(63)\n\
             last_name : varchar(127)\n\
             email : varchar(255)\n\
             phone = null : varchar(16)\n\
             date_joined : date"
                .to_string(),
        ),
        (
            "experimenters.Experimenter.EmergencyContact",
            Tier::Part,
            format!(
                "-> master\n\
                 contact_name : varchar(255)\n\
                 ---\n\
                 relation : varchar(63)\n\
                 phone : varchar(31)\n\
                 email = null : varchar(255)\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "experimenters.Membership",
            Tier::Manual,
            "group_name : varchar(31) # project group\n\
             -> Experimenter"
                .to_string(),
        ),
        (
            "subjects.Species",
            Tier::Manual,
            "species : <lookupname>\n---\ndescription = null : varchar(4000)".to_string(),
        ),
        (
            "subjects.Subject",
            Tier::Manual,
            format!(
                "subject_id : int auto_increment\n\
                 ---\n\
                 subject_name = null : varchar(255) # not necessarily unique\n\
                 -> Species\n\
                 -> experimenters.Experimenter\n\
                 sex = 'U' : enum('F', 'M', 'U')\n\
                 age = null : float # age in days\n\
                 prep_time = CURRENT_TIMESTAMP : timestamp\n\
                 tags = null : <tags>\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "subjects.CellType",
            Tier::Manual,
            "cell_type : <lookupname> # labelled cell type\n---\ndescription = null : varchar(4000)".to_string(),
        ),
        (
            "subjects.FishOrigin",
            Tier::Manual,
            "fish_origin : <lookupname> # facility or lab the fish came from\n---\ndescription = null : varchar(4000)"
                .to_string(),
        ),
        (
            "subjects.FishGenotype",
            Tier::Manual,
            format!(
                "genotype_id : int auto_increment\n\
                 ---\n\
                 date_modified : date\n\
                 chr1 : <chr>\n\
                 chr2 : <chr>\n\
                 chr3 : <chr>\n\
                 chr4 = null : <chr>\n\
                 -> [nullable] CellType\n\
                 public_ids = null : <tags>\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "subjects.FishCross",
            Tier::Manual,
            format!(
                "cross_id : int auto_increment\n\
                 ---\n\
                 date_modified : date\n\
                 -> experimenters.Experimenter\n\
                 cross_schema = null : <crossschema>\n\
                 -> FishGenotype\n\
                 status = 'planned' : enum('planned', 'crossed', 'collecting', 'terminated')\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "subjects.FishStock",
            Tier::Manual,
            format!(
                "stock_id : int auto_increment\n\
                 ---\n\
                 -> FishGenotype\n\
                 -> experimenters.Experimenter\n\
                 date_modified : date\n\
                 status = null : enum('dead', 'missing', 'instock', 'inpersonal', 'quarantine', 'recovery')\n\
                 priority = null : enum('1', '2')\n\
                 -> [nullable] FishOrigin\n\
                 -> [nullable] FishCross\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "equipment.System",
            Tier::Manual,
            format!(
                "system_name : <lookupname>\n\
                 ---\n\
                 date_created : date\n\
                 active = 1 : bool\n\
                 system_data = null : blob@datastore\n\
                 {}",
                COMMENTS
            ),
        ),
        (
            "equipment.System.Piece",
            Tier::Part,
            "-> master\n\
             piece_id = 1 : int\n\
             ---\n\
             model_name : varchar(255)\n\
             link = null : <link>\n\
             piece_file = null : attach@attachstore"
                .to_string(),
        ),
        (
            "recordings.Recording",
            Tier::Manual,
            format!(
                "recording_id : int auto_increment\n\
                 ---\n\
                 -> subjects.Subject\n\
                 -> equipment.System\n\
                 -> [nullable] core.DataType\n\
                 recording_temperature = null : float # Celsius\n\
                 recording_time = CURRENT_TIMESTAMP : timestamp\n\
                 completed = 0 : bool\n\
                 recording_data = null : blob@datastore\n\
                 {}",
                COMMENTS
            ),
        ),
    ]
}

pub fn declare_lab_schema(db: &mut Database, adapters: &AdapterRegistry) -> Result<()> {
    let tables = tables();
    for (name, tier, definition) in &tables {
        declare(db, name, *tier, definition, adapters)?;
    }
    info!(tables = tables.len(), "declared lab schema");
    Ok(())
}

fn row<const N: usize>(values: [(&str, Value); N]) -> Row {
    values.into_iter().map(|(attr, value)| (attr.to_string(), value)).collect()
}

/// Lab schema with a few lookup entries and two experimenters.
pub fn demo_database(adapters: &AdapterRegistry) -> Result<Database> {
    let mut db = Database::new();
    declare_lab_schema(&mut db, adapters)?;

    for data_type in ["numpy.array", "pandas.DataFrame", "csv"] {
        db.insert1("core.DataType", row([("data_type", Value::from(data_type))]))?;
    }
    for species in ["zebrafish", "drosophila"] {
        db.insert1("subjects.Species", row([("species", Value::from(species))]))?;
    }
    for cell_type in ["neuron", "glia"] {
        db.insert1("subjects.CellType", row([("cell_type", Value::from(cell_type))]))?;
    }
    db.insert1("subjects.FishOrigin", row([("fish_origin", Value::from("zirc"))]))?;

    let joined = chrono::NaiveDate::from_ymd_opt(2020, 1, 6).map_or(Value::Null, Value::Date);
    for (user, initials, first, last) in [("alice", "AKR", "Alice", "Kramer"), ("bob", "BLO", "Bob", "Lowe")] {
        db.insert1(
            "experimenters.Experimenter",
            row([
                ("experimenter", Value::from(user)),
                ("experimenter_initials", Value::from(initials)),
                ("first_name", Value::from(first)),
                ("last_name", Value::from(last)),
                ("email", Value::from(format!("{}@lab.example", user))),
                ("date_joined", joined.clone()),
            ]),
        )?;
    }
    Ok(db)
}
