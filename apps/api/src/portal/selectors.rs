//! Ordered selector lists per portal family. The first visible match wins.

use super::fields::{FieldKey, FieldSpec};
use super::PortalFamily;

pub struct FamilySelectors {
    pub login_form: &'static [&'static str],
    pub username: &'static [&'static str],
    pub password: &'static [&'static str],
    pub login_submit: &'static [&'static str],
    pub guest: &'static [&'static str],
    pub apply: &'static [&'static str],
    /// Secondary control some portals show after the apply click.
    pub after_apply: &'static [&'static str],
    pub form_ready: &'static [&'static str],
    pub fields: &'static [FieldSpec],
    pub resume_input: &'static [&'static str],
    pub cover_letter_input: &'static [&'static str],
    pub questionnaire: &'static [&'static str],
    pub next_page: &'static [&'static str],
    pub submit: &'static [&'static str],
    pub success: &'static [&'static str],
    pub form_errors: &'static [&'static str],
}

const LOGIN_FORM: &[&str] = &["input[type='password']"];

const USERNAME: &[&str] = &[
    "input[type='email']",
    "input[name='username']",
    "input[name='email']",
    "input#username",
    "input[autocomplete='username']",
];

const PASSWORD: &[&str] = &["input[type='password']"];

const LOGIN_SUBMIT: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "xpath://button[contains(translate(normalize-space(.), 'SIGNLO', 'signlo'), 'sign in') or contains(translate(normalize-space(.), 'SIGNLO', 'signlo'), 'log in')]",
];

const GUEST: &[&str] = &[
    "xpath://*[self::a or self::button][contains(translate(normalize-space(.), 'GUEST', 'guest'), 'guest')]",
    "xpath://*[self::a or self::button][contains(translate(normalize-space(.), 'WITHOUTACN', 'withoutacn'), 'without an account')]",
];

const SUBMIT: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "xpath://button[contains(translate(normalize-space(.), 'SUBMIT', 'submit'), 'submit')]",
];

const FORM_ERRORS: &[&str] = &[
    ".field-error",
    ".error-message",
    "[aria-invalid='true']",
    "[role='alert']",
];

const NAME_FIELDS: &[FieldSpec] = &[
    FieldSpec::new(FieldKey::FirstName, &["first_name", "firstName", "fname"], &["First Name", "Given Name"], &[]),
    FieldSpec::new(FieldKey::LastName, &["last_name", "lastName", "lname"], &["Last Name", "Family Name", "Surname"], &[]),
    FieldSpec::new(FieldKey::Email, &["email", "email_address"], &["Email", "Email Address"], &[]),
    FieldSpec::new(FieldKey::Phone, &["phone", "phone_number", "mobile"], &["Phone", "Phone Number", "Mobile"], &[]),
    FieldSpec::new(FieldKey::LinkedIn, &["linkedin", "linkedin_url", "urls[LinkedIn]"], &["LinkedIn", "LinkedIn Profile"], &[]),
    FieldSpec::new(FieldKey::Portfolio, &["website", "portfolio", "urls[Portfolio]"], &["Website", "Portfolio"], &[]),
];

static GREENHOUSE: FamilySelectors = FamilySelectors {
    login_form: LOGIN_FORM,
    username: USERNAME,
    password: PASSWORD,
    login_submit: LOGIN_SUBMIT,
    guest: GUEST,
    apply: &[
        "#apply_button",
        "a[href='#app']",
        "button.apply-button",
        "xpath://*[self::a or self::button][contains(translate(normalize-space(.), 'APPLY', 'apply'), 'apply')]",
    ],
    after_apply: &[],
    form_ready: &["#application_form", "form#application-form", "#first_name"],
    fields: NAME_FIELDS,
    resume_input: &["input[type='file'][id*='resume']", "input#resume", "input[name='resume']"],
    cover_letter_input: &["input[type='file'][id*='cover_letter']", "input#cover_letter", "input[name='cover_letter']"],
    questionnaire: &["#custom_fields", ".custom-question", "#demographic_questions"],
    next_page: &[],
    submit: &["#submit_app", "button#submit_app", "button[type='submit']", "input[type='submit']"],
    success: &["#application_confirmation", ".application-confirmation", "[data-qa='confirmation']"],
    form_errors: FORM_ERRORS,
};

static LEVER: FamilySelectors = FamilySelectors {
    login_form: LOGIN_FORM,
    username: USERNAME,
    password: PASSWORD,
    login_submit: LOGIN_SUBMIT,
    guest: GUEST,
    apply: &[
        "a.postings-btn",
        "a[href$='/apply']",
        ".template-btn-submit",
        "xpath://a[contains(translate(normalize-space(.), 'APPLY', 'apply'), 'apply for this job')]",
    ],
    after_apply: &[],
    form_ready: &["form#application-form", "input[name='name']"],
    fields: &[
        FieldSpec::new(FieldKey::FullName, &["name"], &["Full name", "Name"], &[]),
        FieldSpec::new(FieldKey::Email, &["email"], &["Email"], &[]),
        FieldSpec::new(FieldKey::Phone, &["phone"], &["Phone"], &[]),
        FieldSpec::new(FieldKey::LinkedIn, &["urls[LinkedIn]"], &["LinkedIn URL", "LinkedIn"], &[]),
        FieldSpec::new(FieldKey::Portfolio, &["urls[Portfolio]", "urls[Other]"], &["Portfolio URL", "Website"], &[]),
    ],
    resume_input: &["input[name='resume']", "input#resume-upload-input", "input[type='file']"],
    cover_letter_input: &[],
    questionnaire: &[".application-additional", "[data-qa='additional-cards']", ".custom-questions"],
    next_page: &[],
    submit: &["button#btn-submit", "button[data-qa='btn-submit']", "button[type='submit']"],
    success: &[".application-confirmation", "[data-qa='msg-submit-success']", ".thanks"],
    form_errors: FORM_ERRORS,
};

static WORKDAY: FamilySelectors = FamilySelectors {
    login_form: &["input[data-automation-id='password']", "input[type='password']"],
    username: &["input[data-automation-id='email']", "input[type='email']"],
    password: &["input[data-automation-id='password']", "input[type='password']"],
    login_submit: &[
        "[data-automation-id='signInSubmitButton']",
        "button[data-automation-id='click_filter']",
        "button[type='submit']",
    ],
    guest: &[
        "[data-automation-id='applyManually']",
        "[data-automation-id='useMyLastApplication']",
    ],
    apply: &[
        "[data-automation-id='adventureButton']",
        "a[data-uxi-element-id='Apply_adventureButton']",
        "xpath://*[self::a or self::button][normalize-space(.)='Apply']",
    ],
    after_apply: &["[data-automation-id='applyManually']"],
    form_ready: &[
        "[data-automation-id='applyFlowPage']",
        "[data-automation-id='legalNameSection_firstName']",
        "input[data-automation-id='email']",
    ],
    fields: &[
        FieldSpec::new(FieldKey::FirstName, &["legalNameSection_firstName"], &["First Name", "Given Name(s)"], &["input[data-automation-id='legalNameSection_firstName']"]),
        FieldSpec::new(FieldKey::LastName, &["legalNameSection_lastName"], &["Last Name", "Family Name"], &["input[data-automation-id='legalNameSection_lastName']"]),
        FieldSpec::new(FieldKey::Email, &["email"], &["Email Address", "Email"], &["input[data-automation-id='email']"]),
        FieldSpec::new(FieldKey::Phone, &["phone-number"], &["Phone Number"], &["input[data-automation-id='phone-number']"]),
        FieldSpec::new(FieldKey::LinkedIn, &["linkedinQuestion"], &["LinkedIn"], &["input[data-automation-id='linkedinQuestion']"]),
    ],
    resume_input: &["input[data-automation-id='file-upload-input-ref']", "input[type='file']"],
    cover_letter_input: &[],
    questionnaire: &[
        "[data-automation-id='primaryQuestionnairePage']",
        "[data-automation-id='secondaryQuestionnairePage']",
        "[data-automation-id='voluntaryDisclosuresPage']",
    ],
    next_page: &[
        "[data-automation-id='bottom-navigation-next-button']",
        "button[data-automation-id='pageFooterNextButton']",
    ],
    submit: &[
        "[data-automation-id='bottom-navigation-submit-button']",
        "button[data-automation-id='pageFooterSubmitButton']",
    ],
    success: &[
        "[data-automation-id='applicationSubmittedPage']",
        "[data-automation-id='congratulationsPopup']",
    ],
    form_errors: &["[data-automation-id='errorMessage']", "[aria-invalid='true']"],
};

static GENERIC: FamilySelectors = FamilySelectors {
    login_form: LOGIN_FORM,
    username: USERNAME,
    password: PASSWORD,
    login_submit: LOGIN_SUBMIT,
    guest: GUEST,
    apply: &[
        "a[href*='apply']",
        "button.apply-button",
        ".apply-button",
        "#apply",
        "xpath://*[self::a or self::button][contains(translate(normalize-space(.), 'APPLY', 'apply'), 'apply')]",
    ],
    after_apply: &[],
    form_ready: &["form input[type='email']", "form input[name*='email']", "form input[type='file']"],
    fields: NAME_FIELDS,
    resume_input: &["input[type='file'][name*='resume']", "input[type='file'][id*='resume']", "input[type='file'][name*='cv']", "input[type='file']"],
    cover_letter_input: &["input[type='file'][name*='cover']", "input[type='file'][id*='cover']"],
    questionnaire: &["fieldset", ".questions", ".screening-questions", "form"],
    next_page: &[
        "xpath://button[contains(translate(normalize-space(.), 'NEXT', 'next'), 'next') or contains(translate(normalize-space(.), 'CONTINUE', 'continue'), 'continue')]",
    ],
    submit: SUBMIT,
    success: &[".confirmation", ".application-success", "#confirmation", ".thank-you"],
    form_errors: FORM_ERRORS,
};

impl PortalFamily {
    pub fn selectors(&self) -> &'static FamilySelectors {
        match self {
            PortalFamily::Greenhouse => &GREENHOUSE,
            PortalFamily::Lever => &LEVER,
            PortalFamily::Workday => &WORKDAY,
            PortalFamily::Generic => &GENERIC,
        }
    }
}
