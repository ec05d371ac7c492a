//! Built-in content used when neither the server nor the local store has data.

use serde_json::{json, Value};

use super::collection::{Collections, Record};
use super::snapshot::{LogicalTimestamp, Snapshot};

fn record(id: i64, fields: Value) -> Record {
    let fields = match fields {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    Record { id, fields }
}

fn course(id: i64, title: &str, category: &str, description: &str, duration: &str, level: &str) -> Record {
    record(
        id,
        json!({
            "title": title,
            "category": category,
            "description": description,
            "duration": duration,
            "level": level,
            "price": "Free",
        }),
    )
}

fn plan(id: i64, name: &str, price: &str, features: &[&str]) -> Record {
    record(
        id,
        json!({
            "plan": name,
            "price": price,
            "features": features,
        }),
    )
}

fn internship(id: i64, title: &str, spots: u32, description: &str) -> Record {
    record(
        id,
        json!({
            "title": title,
            "duration": "1 months",
            "type": "Remote",
            "spots": spots,
            "description": description,
        }),
    )
}

pub fn default_courses() -> Vec<Record> {
    vec![
        course(1, "Full Stack Development", "Development", "Complete web development course covering frontend and backend technologies.", "12 weeks", "Intermediate"),
        course(2, "Frontend Development", "Development", "Master modern frontend technologies including React, Vue, and Angular.", "8 weeks", "Beginner"),
        course(3, "Backend Development", "Development", "Learn server-side development with Node.js, Python, and databases.", "10 weeks", "Intermediate"),
        course(4, "App Development", "Mobile", "Build mobile applications for iOS and Android platforms.", "6 weeks", "Beginner"),
        course(5, "Data Science & Analytics", "Data Science", "Analyze data and build machine learning models.", "10 weeks", "Advanced"),
        course(6, "Responsive Web Design", "Design", "Create beautiful, responsive websites that work on all devices.", "4 weeks", "Beginner"),
    ]
}

pub fn default_pricing() -> Vec<Record> {
    vec![
        plan(1, "Basic", "Free", &["Access to all courses", "Community support", "Basic certificates"]),
        plan(2, "Premium", "$49/month", &["All Basic features", "1-on-1 mentorship", "Priority support", "Advanced projects"]),
        plan(3, "Enterprise", "$199/month", &["All Premium features", "Custom curriculum", "Team management", "Analytics dashboard"]),
    ]
}

pub fn default_internships() -> Vec<Record> {
    vec![
        internship(1, "Full Stack Development", 15, "Master both frontend and backend technologies while working on real client projects. Build scalable web applications using modern frameworks."),
        internship(2, "Frontend Development", 20, "Create stunning user interfaces and exceptional user experiences using modern frontend technologies and design principles."),
        internship(3, "Backend Development", 12, "Build robust server-side applications, APIs, and database systems that power modern web applications at scale."),
        internship(4, "Mobile App Development", 10, "Develop cross-platform mobile applications using React Native and Flutter, from concept to app store deployment."),
    ]
}

pub fn default_collections() -> Collections {
    Collections {
        courses: default_courses(),
        pricing: default_pricing(),
        internships: default_internships(),
    }
}

/// Defaults carry the epoch timestamp so any real data is newer.
pub fn default_snapshot() -> Snapshot {
    Snapshot::new(default_collections(), LogicalTimestamp::EPOCH)
}
